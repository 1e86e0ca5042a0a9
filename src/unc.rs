// Listing of `//server` roots: one directory entry per SMB disk share.

use crate::dirent::DirEntry;
use crate::error::{Error, Result};
use crate::path::UncRoot;
use crate::platform::{DirectoryApi, ShareKind};

/// Administrative shares that never show up in a listing.
const HIDDEN_SHARES: &[&str] = &["print$", "prnproc$"];

fn listed(name: &str, kind: ShareKind) -> bool {
    kind == ShareKind::Disk && !HIDDEN_SHARES.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Enumerate the disk shares of `root`, following the resume cookie until
/// the server reports no more data.
pub(crate) fn share_entries<D>(dirs: &D, root: &UncRoot) -> Result<Vec<DirEntry>>
where
    D: DirectoryApi + ?Sized,
{
    let server = (!root.local).then_some(root.server.as_str());
    let mut entries: Vec<DirEntry> = Vec::new();
    let mut resume = 0;
    loop {
        let page = dirs
            .enum_shares(server, resume)
            .map_err(|err| Error::from_shares(err, &root.server))?;
        for share in page.shares.iter().filter(|s| listed(&s.name, s.kind)) {
            entries.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            entries.push(DirEntry::share(&share.name));
        }
        match page.resume {
            Some(next) => resume = next,
            None => break,
        }
    }
    log::debug!(
        "//{}: {} disk shares ({})",
        root.server,
        entries.len(),
        if root.local { "local" } else { "remote" }
    );
    Ok(entries)
}
