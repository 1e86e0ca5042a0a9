//! POSIX directory streams over the Win32 bulk directory search.
//!
//! `opendir` takes one snapshot of the directory: every record the native
//! search returns is copied into the stream up front, so later changes to
//! the directory are never observed through an open stream. Reads, seeks and
//! rewinds then only move a cursor over that snapshot.

use core::cmp::Ordering;
use core::ffi::c_char;
use core::mem;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ffi::copy_name;
use crate::path::{dos_path, is_shortcut, search_pattern, unc_root, volume_root};
use crate::platform::{DirectoryApi, FileAttributes, FindData, NativeError, VolumeFlags};
use crate::process::Process;
use crate::reparse::{self, IO_REPARSE_TAG_MOUNT_POINT};
use crate::unc;

/// Tag carried by every live stream.
pub const DIR_MAGIC: u32 = 0x5733_3264;
/// Longest name in UTF-8 bytes. A 255 unit Win32 name takes up to 765.
pub const MAXNAMLEN: usize = 1024;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

/// One snapshot record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: String,
    size: u64,
    attributes: FileAttributes,
    created: i64,
    modified: i64,
    file_type: u8,
}

impl DirEntry {
    fn from_find(data: FindData, fold_case: bool) -> Self {
        let file_type = if data.attributes.contains(FileAttributes::DIRECTORY) {
            DT_DIR
        } else if data.attributes.contains(FileAttributes::REPARSE_POINT)
            && data.reparse_tag == IO_REPARSE_TAG_MOUNT_POINT
        {
            DT_LNK
        } else {
            DT_REG
        };
        let name = if fold_case { data.name.to_lowercase() } else { data.name };
        DirEntry {
            name,
            size: data.size,
            attributes: data.attributes,
            created: data.created,
            modified: data.modified,
            file_type,
        }
    }

    /// Entry standing for an SMB disk share.
    pub(crate) fn share(name: &str) -> Self {
        DirEntry {
            name: name.to_string(),
            size: 0,
            attributes: FileAttributes::DIRECTORY,
            created: 0,
            modified: 0,
            file_type: DT_DIR,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_high(&self) -> u32 {
        (self.size >> 32) as u32
    }

    pub fn size_low(&self) -> u32 {
        self.size as u32
    }

    pub fn attributes(&self) -> FileAttributes {
        self.attributes
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn modified(&self) -> i64 {
        self.modified
    }

    pub fn file_type(&self) -> u8 {
        self.file_type
    }
}

/// `struct dirent` as handed out by [`DirStream::read`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dirent {
    pub d_fileno: u64,
    pub d_reclen: u16,
    pub d_namlen: u16,
    pub d_ctime: i64,
    pub d_mtime: i64,
    pub d_size: u64,
    pub d_attr: u32,
    pub d_type: u8,
    pub d_name: String,
}

impl Dirent {
    pub fn name(&self) -> &str {
        &self.d_name
    }

    /// Overwrite with `entry`, reusing the name buffer.
    fn fill(&mut self, entry: &DirEntry) {
        self.d_fileno = 0;
        self.d_namlen = entry.name.len().min(u16::MAX as usize) as u16;
        self.d_reclen = RawDirent::record_len(entry.name.len());
        self.d_ctime = entry.created;
        self.d_mtime = entry.modified;
        self.d_size = entry.size;
        self.d_attr = entry.attributes.bits();
        self.d_type = entry.file_type;
        self.d_name.clear();
        self.d_name.push_str(&entry.name);
    }
}

/// C layout of `struct dirent`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDirent {
    pub d_fileno: u32,
    pub d_reclen: u16,
    pub d_namlen: u16,
    pub d_ctime: i64,
    pub d_mtime: i64,
    pub d_size: u32,
    pub d_attr: u32,
    pub d_type: u8,
    pub d_name: [c_char; MAXNAMLEN + 1],
}

impl RawDirent {
    pub fn zeroed() -> Self {
        RawDirent {
            d_fileno: 0,
            d_reclen: 0,
            d_namlen: 0,
            d_ctime: 0,
            d_mtime: 0,
            d_size: 0,
            d_attr: 0,
            d_type: DT_UNKNOWN,
            d_name: [0; MAXNAMLEN + 1],
        }
    }

    /// Fixed part of the record plus the name and its terminator.
    fn record_len(namlen: usize) -> u16 {
        let fixed = mem::size_of::<RawDirent>() - (MAXNAMLEN + 1);
        (fixed + namlen.min(MAXNAMLEN) + 1) as u16
    }

    pub fn fill_from(&mut self, entry: &Dirent) {
        self.d_fileno = entry.d_fileno as u32;
        self.d_ctime = entry.d_ctime;
        self.d_mtime = entry.d_mtime;
        self.d_size = entry.d_size as u32;
        self.d_attr = entry.d_attr;
        self.d_type = entry.d_type;
        self.d_namlen = copy_name(&mut self.d_name, &entry.d_name) as u16;
        self.d_reclen = Self::record_len(self.d_namlen as usize);
    }
}

/// An open directory stream.
#[derive(Debug)]
pub struct DirStream {
    magic: u32,
    id: u64,
    entries: Vec<DirEntry>,
    cursor: usize,
    case_preserving: bool,
    scratch: Dirent,
}

impl DirStream {
    fn new(id: u64, entries: Vec<DirEntry>, case_preserving: bool) -> Self {
        DirStream {
            magic: DIR_MAGIC,
            id,
            entries,
            cursor: 0,
            case_preserving,
            scratch: Dirent::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.magic == DIR_MAGIC
    }

    pub fn is_case_preserving(&self) -> bool {
        self.case_preserving
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next entry, or `None` once the snapshot is exhausted.
    pub fn read(&mut self) -> Option<&Dirent> {
        let entry = self.entries.get(self.cursor)?;
        self.scratch.fill(entry);
        self.cursor += 1;
        Some(&self.scratch)
    }

    /// `readdir_r`: fill `entry` with the next record. `Ok(false)` at the
    /// end; a name over `MAXNAMLEN` bytes fails without advancing.
    pub fn read_into(&mut self, entry: &mut Dirent) -> Result<bool> {
        let Some(next) = self.entries.get(self.cursor) else {
            return Ok(false);
        };
        if next.name.len() > MAXNAMLEN {
            return Err(Error::NameTooLong(next.name.clone()));
        }
        entry.fill(next);
        self.cursor += 1;
        Ok(true)
    }

    /// Walk `pos` entries from the head, stopping at the end of the list.
    pub fn seek(&mut self, pos: i64) -> Result<()> {
        if pos < 0 {
            return Err(Error::InvalidArgument("negative directory offset"));
        }
        self.cursor = usize::try_from(pos).unwrap_or(usize::MAX).min(self.entries.len());
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Number of entries read since open, rewind or seek.
    pub fn tell(&self) -> i64 {
        self.cursor as i64
    }

    /// Consume the stream, releasing its snapshot.
    pub fn close(self) {}
}

/// Strict-weak `strcmp` order of the names.
pub fn alphasort(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.name.as_bytes().cmp(b.name.as_bytes())
}

/// Order names with embedded numbers numerically (`file9` before `file10`);
/// runs with leading zeros sort as fractions (`00` before `0`).
pub fn versionsort(a: &DirEntry, b: &DirEntry) -> Ordering {
    strverscmp(a.name.as_bytes(), b.name.as_bytes())
}

fn strverscmp(s1: &[u8], s2: &[u8]) -> Ordering {
    let at = |s: &[u8], i: usize| s.get(i).copied().unwrap_or(0);
    let digit = |c: u8| c.is_ascii_digit();
    let (mut i, mut j) = (0, 0);

    while at(s1, i) != 0 && at(s2, j) != 0 {
        let (c1, c2) = (at(s1, i), at(s2, j));
        if !digit(c1) || !digit(c2) {
            if c1 != c2 {
                return c1.cmp(&c2);
            }
            i += 1;
            j += 1;
            continue;
        }
        if c1 == b'0' || c2 == b'0' {
            let zeros1 = s1[i..].iter().take_while(|&&c| c == b'0').count();
            let zeros2 = s2[j..].iter().take_while(|&&c| c == b'0').count();
            i += zeros1;
            j += zeros2;
            if zeros1 != zeros2 {
                return zeros2.cmp(&zeros1);
            }
            match (digit(at(s1, i)), digit(at(s2, j))) {
                (false, true) => return Ordering::Greater,
                (true, false) => return Ordering::Less,
                _ => {}
            }
        } else {
            let len1 = s1[i..].iter().take_while(|c| c.is_ascii_digit()).count();
            let len2 = s2[j..].iter().take_while(|c| c.is_ascii_digit()).count();
            if len1 != len2 {
                return len1.cmp(&len2);
            }
        }
        while digit(at(s1, i)) && digit(at(s2, j)) {
            if at(s1, i) != at(s2, j) {
                return at(s1, i).cmp(&at(s2, j));
            }
            i += 1;
            j += 1;
        }
    }
    at(s1, i).cmp(&at(s2, j))
}

fn is_case_preserving<D>(dirs: &D, directory: &str) -> bool
where
    D: DirectoryApi + ?Sized,
{
    let wanted = VolumeFlags::CASE_SENSITIVE | VolumeFlags::CASE_PRESERVED;
    volume_root(directory, dirs.current_drive())
        .and_then(|root| dirs.volume_flags(&root))
        .map_or(false, |flags| flags.contains(wanted))
}

/// Follow the reparse point at `link` to the directory it stands for.
fn redirect<D>(dirs: &D, link: &str) -> Result<String>
where
    D: DirectoryApi + ?Sized,
{
    let denied = || Error::PermissionDenied { path: link.to_string() };
    let buffer = dirs.read_reparse_point(link).map_err(|err| {
        log::debug!("{link}: reparse read failed: {err}");
        denied()
    })?;
    let point = reparse::decode(&buffer).map_err(|err| {
        log::debug!("{link}: {err}");
        denied()
    })?;
    let target = reparse::resolve(&point, link, dirs).map_err(|err| {
        log::debug!("{link}: {err}");
        denied()
    })?;
    log::trace!("{link} -> {target}");
    Ok(target)
}

/// Resolve `path` to the directory that will actually be searched.
fn search_target<D>(dirs: &D, path: &str, full: String) -> Result<String>
where
    D: DirectoryApi + ?Sized,
{
    if path == "." {
        return Ok(full);
    }
    let attributes =
        dirs.file_attributes(&full).map_err(|err| Error::from_attributes(err, &full))?;

    if !attributes.contains(FileAttributes::DIRECTORY) {
        if is_shortcut(&full) {
            if let Some(target) = dirs.read_shortcut(&full) {
                let is_dir = dirs
                    .file_attributes(&target)
                    .map_or(false, |a| a.contains(FileAttributes::DIRECTORY));
                if is_dir {
                    log::trace!("{full} -> {target}");
                    return Ok(target);
                }
            }
        }
        return Err(Error::NotADirectory { path: full });
    }
    if attributes.contains(FileAttributes::REPARSE_POINT) {
        return redirect(dirs, &full);
    }
    Ok(full)
}

fn collect<D>(dirs: &D, pattern: &str, fold_case: bool) -> Result<Vec<DirEntry>>
where
    D: DirectoryApi + ?Sized,
{
    let records = match dirs.find_files(pattern) {
        Ok(records) => records,
        Err(err) => return Err(Error::from_search(err, pattern)),
    };
    let mut entries: Vec<DirEntry> = Vec::new();
    for record in records {
        let data = match record {
            Ok(data) => data,
            Err(NativeError::NoMoreFiles) => break,
            Err(err) => return Err(Error::from_search(err, pattern)),
        };
        if data.attributes.contains(FileAttributes::VOLUME) || data.name == "." {
            continue;
        }
        entries.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        entries.push(DirEntry::from_find(data, fold_case));
    }
    Ok(entries)
}

/// Open a stream on `path`.
pub(crate) fn open_stream<D>(dirs: &D, config: &Config, path: &str, id: u64) -> Result<DirStream>
where
    D: DirectoryApi + ?Sized,
{
    if path.is_empty() {
        return Err(Error::NotADirectory { path: String::new() });
    }
    let full = dirs.full_path(path).unwrap_or_else(|| {
        log::trace!("{path}: full path unavailable, using DOS form");
        dos_path(path)
    });

    let computer_name = dirs.computer_name();
    let unc = unc_root(&full, computer_name.as_deref(), &config.local_aliases)
        .or_else(|| unc_root(path, computer_name.as_deref(), &config.local_aliases));
    if let Some(root) = unc {
        let entries = unc::share_entries(dirs, &root)?;
        return Ok(DirStream::new(id, entries, true));
    }

    let target = search_target(dirs, path, full)?;
    let case_preserving = is_case_preserving(dirs, &target);
    let pattern = search_pattern(&target);

    let cookie = if config.disable_fs_redirection {
        let cookie = dirs.disable_fs_redirection();
        if cookie.is_none() {
            log::warn!("{pattern}: file-system redirection left enabled");
        }
        cookie
    } else {
        None
    };
    let listed = collect(dirs, &pattern, !case_preserving);
    let reverted = cookie.map_or(true, |cookie| dirs.revert_fs_redirection(cookie));

    let entries = listed?;
    if !reverted {
        return Err(Error::Io(format!("{pattern}: file-system redirection not restored")));
    }
    log::debug!("opendir({path}): {} entries from {pattern}", entries.len());
    Ok(DirStream::new(id, entries, case_preserving))
}

impl Process {
    pub fn opendir(&mut self, path: &str) -> Result<DirStream> {
        let id = self.next_dir_id();
        open_stream(&*self.host, &self.config, path, id)
    }

    /// Read all of `path`, keep the entries `filter` accepts and sort them
    /// with `compare`.
    pub fn scandir<F, C>(&mut self, path: &str, mut filter: F, compare: C) -> Result<Vec<DirEntry>>
    where
        F: FnMut(&DirEntry) -> bool,
        C: FnMut(&DirEntry, &DirEntry) -> Ordering,
    {
        let stream = self.opendir(path)?;
        let mut selected: Vec<DirEntry> = Vec::new();
        for entry in stream.entries().iter().filter(|e| filter(e)) {
            selected.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            selected.push(entry.clone());
        }
        stream.close();
        selected.sort_by(compare);
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> DirEntry {
        DirEntry::share(name)
    }

    fn stream(names: &[&str]) -> DirStream {
        DirStream::new(1, names.iter().map(|n| entry(n)).collect(), true)
    }

    #[test]
    fn test_read_until_exhausted() {
        let mut dir = stream(&["..", "a", "b"]);
        assert_eq!(dir.read().unwrap().name(), "..");
        assert_eq!(dir.read().unwrap().name(), "a");
        assert_eq!(dir.read().unwrap().name(), "b");
        assert!(dir.read().is_none());
        assert!(dir.read().is_none());
        assert_eq!(dir.tell(), 3);
    }

    #[test]
    fn test_seek_clamps_and_rejects_negative() {
        let mut dir = stream(&["a", "b", "c"]);
        dir.seek(2).unwrap();
        assert_eq!(dir.tell(), 2);
        assert_eq!(dir.read().unwrap().name(), "c");
        dir.seek(10).unwrap();
        assert_eq!(dir.tell(), 3);
        assert!(dir.read().is_none());
        assert!(matches!(dir.seek(-1), Err(Error::InvalidArgument(_))));
        assert_eq!(dir.tell(), 3);
        dir.seek(0).unwrap();
        assert_eq!(dir.read().unwrap().name(), "a");
    }

    #[test]
    fn test_read_into_name_too_long() {
        let long = "x".repeat(MAXNAMLEN + 1);
        let mut dir = stream(&["ok", &long]);
        let mut out = Dirent::default();
        assert_eq!(dir.read_into(&mut out), Ok(true));
        assert_eq!(out.name(), "ok");
        assert_eq!(out.d_namlen, 2);
        assert!(matches!(dir.read_into(&mut out), Err(Error::NameTooLong(_))));
        assert_eq!(dir.tell(), 1);
    }

    #[test]
    fn test_raw_dirent() {
        let mut dir = stream(&["share"]);
        let mut raw = RawDirent::zeroed();
        raw.fill_from(dir.read().unwrap());
        assert_eq!(raw.d_namlen, 5);
        assert_eq!(raw.d_type, DT_DIR);
        assert_eq!(raw.d_name[5], 0);
        assert_eq!(raw.d_reclen as usize, mem::size_of::<RawDirent>() - MAXNAMLEN + 5);
    }

    #[test]
    fn test_entry_types() {
        let find = |attributes, reparse_tag| FindData {
            name: "Name".into(),
            attributes,
            size: 0x1_0000_0002,
            created: 0,
            modified: 0,
            reparse_tag,
        };
        let dir = DirEntry::from_find(find(FileAttributes::DIRECTORY, 0), false);
        assert_eq!(dir.file_type(), DT_DIR);
        assert_eq!(dir.size_high(), 1);
        assert_eq!(dir.size_low(), 2);
        let link = DirEntry::from_find(
            find(FileAttributes::REPARSE_POINT, IO_REPARSE_TAG_MOUNT_POINT),
            true,
        );
        assert_eq!(link.file_type(), DT_LNK);
        assert_eq!(link.name(), "name");
        let file = DirEntry::from_find(find(FileAttributes::ARCHIVE, 0), false);
        assert_eq!(file.file_type(), DT_REG);
    }

    #[test]
    fn test_versionsort() {
        let mut names: Vec<DirEntry> =
            ["file10", "file9", "file09", "file0", "file1", "alpha"].iter().map(|n| entry(n)).collect();
        names.sort_by(versionsort);
        let sorted: Vec<&str> = names.iter().map(|e| e.name()).collect();
        assert_eq!(sorted, vec!["alpha", "file09", "file0", "file1", "file9", "file10"]);
    }

    #[test]
    fn test_alphasort() {
        assert_eq!(alphasort(&entry("B"), &entry("a")), Ordering::Less);
        assert_eq!(alphasort(&entry("a"), &entry("a")), Ordering::Equal);
    }
}
