use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::path::{drive_letter, WinPathBuf};
use crate::platform::{
    DirectoryApi, FileAttributes, FindData, FindIter, NativeError, RedirectionCookie, ShareInfo,
    ShareKind, SharePage, VolumeFlags,
};
use crate::reparse;

const ERROR_ALREADY_EXISTS: u32 = 183;
const ERROR_BAD_NETPATH: u32 = 53;

/// Timestamp given to entries that were never stamped explicitly.
pub const DEFAULT_TIME: i64 = 1_600_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
    /// Directory carrying a raw reparse buffer (symbolic link, junction,
    /// volume mount point or something foreign).
    ReparsePoint(Vec<u8>),
    /// `.lnk` shell shortcut naming `target`.
    Shortcut(String),
}

#[derive(Debug, Clone)]
pub struct Inode {
    number: u64,
    name: String,
    size: u64,
    ctime: i64,
    mtime: i64,
    kind: InodeKind,
    children: Vec<u64>,
}

impl Inode {
    fn new(number: u64, name: &str, size: u64, kind: InodeKind) -> Self {
        Inode {
            number,
            name: name.to_string(),
            size,
            ctime: DEFAULT_TIME,
            mtime: DEFAULT_TIME,
            kind,
            children: vec![],
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    pub fn attributes(&self) -> FileAttributes {
        match &self.kind {
            InodeKind::File | InodeKind::Shortcut(_) => FileAttributes::ARCHIVE,
            InodeKind::Directory => FileAttributes::DIRECTORY,
            InodeKind::ReparsePoint(_) => FileAttributes::DIRECTORY | FileAttributes::REPARSE_POINT,
        }
    }

    fn reparse_tag(&self) -> u32 {
        match &self.kind {
            InodeKind::ReparsePoint(data) => data
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn find_data(&self, name: &str) -> FindData {
        FindData {
            name: name.to_string(),
            attributes: self.attributes(),
            size: self.size,
            created: self.ctime,
            modified: self.mtime,
            reparse_tag: self.reparse_tag(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SearchFault {
    after: usize,
    error: NativeError,
}

#[derive(Debug, Default)]
struct State {
    inodes: HashMap<u64, Inode>,
    paths: HashMap<String, u64>,
    next_inode_number: u64,
    volumes: HashMap<String, VolumeFlags>,
    labels: HashMap<String, String>,
    guids: HashMap<String, String>,
    cwd: String,
    computer_name: Option<String>,
    /// Shares keyed by lower-cased server name; `None` is this machine.
    shares: HashMap<Option<String>, Vec<ShareInfo>>,
    share_page: usize,
    share_error: Option<NativeError>,
    failing_paths: HashMap<String, NativeError>,
    search_fault: Option<SearchFault>,
    disable_fails: bool,
    revert_fails: bool,
}

/// In-memory Win32 volume set.
///
/// Paths are case-insensitive and case-preserving. Lookups never follow
/// reparse points, the way `FILE_FLAG_OPEN_REPARSE_POINT` opens behave.
/// Besides the namespace it carries the machine facts a directory stream
/// consults: volume flags, the computer name, SMB shares and volume GUIDs.
#[derive(Debug)]
pub struct MemFileSystem {
    state: RwLock<State>,
    searches: AtomicUsize,
    share_enumerations: AtomicUsize,
    redirections_disabled: AtomicUsize,
    redirections_reverted: AtomicUsize,
}

impl MemFileSystem {
    /// A machine named `WORKSTATION` with an empty, case-preserving `C:`.
    pub fn new() -> Self {
        let fs = Self {
            state: RwLock::new(State {
                next_inode_number: 1,
                cwd: "C:\\".to_string(),
                computer_name: Some("WORKSTATION".to_string()),
                share_page: 2,
                ..State::default()
            }),
            searches: AtomicUsize::new(0),
            share_enumerations: AtomicUsize::new(0),
            redirections_disabled: AtomicUsize::new(0),
            redirections_reverted: AtomicUsize::new(0),
        };
        fs.add_volume("C:\\", VolumeFlags::CASE_SENSITIVE | VolumeFlags::CASE_PRESERVED);
        fs
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn absolute(&self, path: &str) -> WinPathBuf {
        let path = WinPathBuf::from(path);
        if path.is_absolute() {
            return path.normalize();
        }
        let cwd = self.read().cwd.clone();
        match drive_letter(path.as_str()) {
            // drive relative, resolved against that drive's root
            Some(letter) => WinPathBuf::from(format!("{letter}:\\"))
                .join(&path.as_str()[2..])
                .normalize(),
            None if path.as_str().starts_with('\\') => {
                WinPathBuf::from(&cwd[..2]).join(path.as_str()).normalize()
            }
            None => WinPathBuf::from(cwd).join(path.as_str()).normalize(),
        }
    }

    fn key(&self, path: &str) -> String {
        self.absolute(path).key()
    }

    // --------------------
    // Machine setup
    // --------------------

    /// Mount an empty volume at `root` (`X:\` or `\\server\share\`).
    pub fn add_volume(&self, root: &str, flags: VolumeFlags) {
        let root_path = WinPathBuf::from(root);
        let key = root_path.key();
        let mut state = self.write();
        state.volumes.insert(key.clone(), flags);
        if !state.paths.contains_key(&key) {
            let number = state.next_inode_number;
            state.next_inode_number += 1;
            state.inodes.insert(number, Inode::new(number, root_path.as_str(), 0, InodeKind::Directory));
            state.paths.insert(key, number);
        }
    }

    pub fn set_volume_flags(&self, root: &str, flags: VolumeFlags) {
        self.write().volumes.insert(WinPathBuf::from(root).key(), flags);
    }

    /// Give the volume at `root` a label; searches of the root report it as a
    /// volume pseudo-entry.
    pub fn set_volume_label(&self, root: &str, label: &str) {
        self.write().labels.insert(WinPathBuf::from(root).key(), label.to_string());
    }

    /// Map a `\\?\Volume{guid}\` name to the path it is mounted on.
    pub fn add_volume_guid(&self, volume: &str, mount_path: &str) {
        self.write().guids.insert(volume.to_ascii_lowercase(), mount_path.to_string());
    }

    pub fn set_current_dir(&self, path: &str) {
        let cwd = self.absolute(path).as_str().to_string();
        self.write().cwd = cwd;
    }

    pub fn set_computer_name(&self, name: Option<&str>) {
        self.write().computer_name = name.map(str::to_string);
    }

    /// Publish a share; `server == None` is this machine.
    pub fn add_share(&self, server: Option<&str>, name: &str, kind: ShareKind) {
        let server = server.map(str::to_ascii_lowercase);
        self.write()
            .shares
            .entry(server)
            .or_default()
            .push(ShareInfo { name: name.to_string(), kind });
    }

    /// Number of shares returned per enumeration page.
    pub fn set_share_page_size(&self, page: usize) {
        self.write().share_page = page.max(1);
    }

    pub fn fail_share_enumeration(&self, error: Option<NativeError>) {
        self.write().share_error = error;
    }

    /// Attribute queries and searches of `path` fail with `error`.
    pub fn fail_path(&self, path: &str, error: NativeError) {
        let key = self.key(path);
        self.write().failing_paths.insert(key, error);
    }

    /// The next searches yield `after` records and then fail with `error`;
    /// `after == 0` fails the search itself.
    pub fn fail_searches(&self, after: usize, error: NativeError) {
        self.write().search_fault = Some(SearchFault { after, error });
    }

    pub fn clear_search_fault(&self) {
        self.write().search_fault = None;
    }

    pub fn fail_redirection(&self, disable: bool, revert: bool) {
        let mut state = self.write();
        state.disable_fails = disable;
        state.revert_fails = revert;
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn share_enumeration_count(&self) -> usize {
        self.share_enumerations.load(Ordering::SeqCst)
    }

    /// `(disabled, reverted)` redirection calls so far.
    pub fn redirection_counts(&self) -> (usize, usize) {
        (
            self.redirections_disabled.load(Ordering::SeqCst),
            self.redirections_reverted.load(Ordering::SeqCst),
        )
    }

    // --------------------
    // File Operations
    // --------------------

    pub fn lookup(&self, path: &str) -> Option<Inode> {
        let key = self.key(path);
        let state = self.read();
        state.paths.get(&key).and_then(|number| state.inodes.get(number)).cloned()
    }

    fn insert(&self, path: &str, size: u64, kind: InodeKind) -> Result<u64, NativeError> {
        let path = self.absolute(path);
        let name = path.file_name().ok_or(NativeError::AccessDenied)?.to_string();
        let parent = path.parent().ok_or(NativeError::PathNotFound)?;

        let mut state = self.write();
        if state.paths.contains_key(&path.key()) {
            return Err(NativeError::Other(ERROR_ALREADY_EXISTS));
        }
        let parent_number = *state.paths.get(&parent.key()).ok_or(NativeError::PathNotFound)?;
        match state.inodes.get(&parent_number).map(|p| &p.kind) {
            Some(InodeKind::Directory) => {}
            _ => return Err(NativeError::PathNotFound),
        }

        let number = state.next_inode_number;
        state.next_inode_number += 1;
        state.inodes.insert(number, Inode::new(number, &name, size, kind));
        state.paths.insert(path.key(), number);
        if let Some(parent) = state.inodes.get_mut(&parent_number) {
            parent.children.push(number);
        }
        Ok(number)
    }

    pub fn create_file(&self, path: &str, size: u64) -> Result<(), NativeError> {
        self.insert(path, size, InodeKind::File).map(|_| ())
    }

    /// Stamp creation and modification times (Unix seconds).
    pub fn set_times(&self, path: &str, created: i64, modified: i64) -> Result<(), NativeError> {
        let key = self.key(path);
        let mut state = self.write();
        let number = *state.paths.get(&key).ok_or(NativeError::FileNotFound)?;
        let inode = state.inodes.get_mut(&number).ok_or(NativeError::FileNotFound)?;
        inode.ctime = created;
        inode.mtime = modified;
        Ok(())
    }

    /// Directory symbolic link. A target without a root is stored relative.
    pub fn symlink(&self, link: &str, target: &str) -> Result<(), NativeError> {
        let absolute = WinPathBuf::from(target).is_absolute();
        let data = if absolute {
            reparse::encode_symlink(&format!("\\??\\{}", WinPathBuf::from(target)), false)
        } else {
            reparse::encode_symlink(WinPathBuf::from(target).as_str(), true)
        };
        self.reparse_point(link, data)
    }

    pub fn junction(&self, link: &str, target: &str) -> Result<(), NativeError> {
        let data = reparse::encode_mount_point(&format!("\\??\\{}", WinPathBuf::from(target)));
        self.reparse_point(link, data)
    }

    /// Mount the volume `\\?\Volume{guid}\` on the directory `link`.
    pub fn mount_volume(&self, link: &str, volume: &str) -> Result<(), NativeError> {
        let guid = volume.strip_prefix("\\\\?\\").unwrap_or(volume);
        let data = reparse::encode_mount_point(&format!("\\??\\{guid}"));
        self.reparse_point(link, data)
    }

    /// Directory carrying an arbitrary reparse buffer.
    pub fn reparse_point(&self, link: &str, data: Vec<u8>) -> Result<(), NativeError> {
        self.insert(link, 0, InodeKind::ReparsePoint(data)).map(|_| ())
    }

    pub fn shortcut(&self, path: &str, target: &str) -> Result<(), NativeError> {
        self.insert(path, 0, InodeKind::Shortcut(target.to_string())).map(|_| ())
    }

    /// Delete a file or shortcut.
    pub fn unlink(&self, path: &str) -> Result<(), NativeError> {
        let path = self.absolute(path);
        let parent = path.parent().ok_or(NativeError::AccessDenied)?;
        let mut state = self.write();
        let number = *state.paths.get(&path.key()).ok_or(NativeError::FileNotFound)?;
        let inode = state.inodes.get(&number).ok_or(NativeError::FileNotFound)?;
        if !matches!(inode.kind, InodeKind::File | InodeKind::Shortcut(_)) {
            return Err(NativeError::AccessDenied);
        }

        state.inodes.remove(&number);
        state.paths.remove(&path.key());
        if let Some(parent_number) = state.paths.get(&parent.key()).copied() {
            if let Some(parent) = state.inodes.get_mut(&parent_number) {
                parent.children.retain(|child| *child != number);
            }
        }
        Ok(())
    }

    // --------------------
    // Directory Operations
    // --------------------

    pub fn mkdir(&self, path: &str) -> Result<(), NativeError> {
        self.insert(path, 0, InodeKind::Directory).map(|_| ())
    }

    /// Create `path` and any missing parents below an existing volume root.
    pub fn mkdir_all(&self, path: &str) -> Result<(), NativeError> {
        let path = self.absolute(path);
        let mut pending = vec![];
        let mut cursor = Some(path);
        while let Some(dir) = cursor {
            if self.lookup(dir.as_str()).is_some() {
                break;
            }
            cursor = dir.parent();
            pending.push(dir);
        }
        for dir in pending.iter().rev() {
            self.mkdir(dir.as_str())?;
        }
        Ok(())
    }

    fn snapshot(&self, dir: &WinPathBuf) -> Result<Vec<FindData>, NativeError> {
        let key = dir.key();
        let state = self.read();
        if let Some(error) = state.failing_paths.get(&key) {
            return Err(*error);
        }
        let number = state.paths.get(&key).ok_or(NativeError::PathNotFound)?;
        let inode = state.inodes.get(number).ok_or(NativeError::PathNotFound)?;
        if !matches!(inode.kind, InodeKind::Directory) {
            return Err(NativeError::PathNotFound);
        }

        let mut records = Vec::with_capacity(inode.children.len() + 3);
        if let Some(label) = state.labels.get(&key) {
            records.push(FindData {
                name: label.clone(),
                attributes: FileAttributes::VOLUME,
                size: 0,
                created: DEFAULT_TIME,
                modified: DEFAULT_TIME,
                reparse_tag: 0,
            });
        }
        if let Some(parent) = dir.parent() {
            records.push(inode.find_data("."));
            let parent = state.paths.get(&parent.key()).and_then(|n| state.inodes.get(n));
            records.push(parent.unwrap_or(inode).find_data(".."));
        }
        for child in inode.children.iter().filter_map(|n| state.inodes.get(n)) {
            records.push(child.find_data(&child.name));
        }
        Ok(records)
    }
}

impl DirectoryApi for MemFileSystem {
    fn full_path(&self, path: &str) -> Option<String> {
        if path.is_empty() {
            return None;
        }
        Some(self.absolute(path).as_str().to_string())
    }

    fn file_attributes(&self, path: &str) -> Result<FileAttributes, NativeError> {
        let path = self.absolute(path);
        let state = self.read();
        if let Some(error) = state.failing_paths.get(&path.key()) {
            return Err(*error);
        }
        if let Some(inode) = state.paths.get(&path.key()).and_then(|n| state.inodes.get(n)) {
            return Ok(inode.attributes());
        }
        let parent_is_dir = path
            .parent()
            .and_then(|parent| state.paths.get(&parent.key()))
            .and_then(|n| state.inodes.get(n))
            .map_or(false, |p| matches!(p.kind, InodeKind::Directory));
        if parent_is_dir {
            Err(NativeError::FileNotFound)
        } else {
            Err(NativeError::PathNotFound)
        }
    }

    fn find_files<'a>(&'a self, pattern: &str) -> Result<FindIter<'a>, NativeError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let dir = pattern.strip_suffix("\\*.*").unwrap_or(pattern);
        let dir = if dir.len() == 2 && drive_letter(dir).is_some() {
            WinPathBuf::from(format!("{dir}\\"))
        } else {
            self.absolute(dir)
        };
        let records = self.snapshot(&dir)?;

        match self.read().search_fault {
            Some(SearchFault { after: 0, error }) => Err(error),
            Some(SearchFault { after, error }) => Ok(Box::new(
                records
                    .into_iter()
                    .take(after)
                    .map(Ok)
                    .chain(std::iter::once(Err(error))),
            )),
            None => Ok(Box::new(records.into_iter().map(Ok))),
        }
    }

    fn read_reparse_point(&self, path: &str) -> Result<Vec<u8>, NativeError> {
        match self.lookup(path).map(|inode| inode.kind) {
            Some(InodeKind::ReparsePoint(data)) => Ok(data),
            Some(_) => Err(NativeError::NotAReparsePoint),
            None => Err(NativeError::FileNotFound),
        }
    }

    fn volume_path_names(&self, volume: &str) -> Result<Vec<String>, NativeError> {
        self.read()
            .guids
            .get(&volume.to_ascii_lowercase())
            .map(|path| vec![path.clone()])
            .ok_or(NativeError::FileNotFound)
    }

    fn read_shortcut(&self, path: &str) -> Option<String> {
        match self.lookup(path)?.kind {
            InodeKind::Shortcut(target) => Some(target),
            _ => None,
        }
    }

    fn volume_flags(&self, root: &str) -> Option<VolumeFlags> {
        self.read().volumes.get(&WinPathBuf::from(root).key()).copied()
    }

    fn current_drive(&self) -> Option<char> {
        drive_letter(&self.read().cwd)
    }

    fn computer_name(&self) -> Option<String> {
        self.read().computer_name.clone()
    }

    fn enum_shares(&self, server: Option<&str>, resume: u32) -> Result<SharePage, NativeError> {
        self.share_enumerations.fetch_add(1, Ordering::SeqCst);
        let state = self.read();
        if let Some(error) = state.share_error {
            return Err(error);
        }
        let shares = state
            .shares
            .get(&server.map(str::to_ascii_lowercase))
            .ok_or(NativeError::Other(ERROR_BAD_NETPATH))?;
        let start = (resume as usize).min(shares.len());
        let end = (start + state.share_page).min(shares.len());
        Ok(SharePage {
            shares: shares[start..end].to_vec(),
            resume: (end < shares.len()).then_some(end as u32),
        })
    }

    fn disable_fs_redirection(&self) -> Option<RedirectionCookie> {
        let count = self.redirections_disabled.fetch_add(1, Ordering::SeqCst);
        if self.read().disable_fails {
            return None;
        }
        Some(RedirectionCookie(count + 1))
    }

    fn revert_fs_redirection(&self, _cookie: RedirectionCookie) -> bool {
        self.redirections_reverted.fetch_add(1, Ordering::SeqCst);
        !self.read().revert_fails
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fs: &MemFileSystem, pattern: &str) -> Vec<String> {
        fs.find_files(pattern).unwrap().map(|r| r.unwrap().name).collect()
    }

    #[test]
    fn test_mkdir_and_search() {
        let fs = MemFileSystem::new();
        fs.mkdir("C:\\data").unwrap();
        fs.create_file("C:\\data\\a.txt", 10).unwrap();
        fs.create_file("C:\\data\\B.TXT", 20).unwrap();
        assert_eq!(names(&fs, "C:\\data\\*.*"), vec![".", "..", "a.txt", "B.TXT"]);
        assert_eq!(names(&fs, "C:\\*.*"), vec!["data"]);
        assert_eq!(fs.search_count(), 2);
    }

    #[test]
    fn test_attributes_and_errors() {
        let fs = MemFileSystem::new();
        fs.mkdir("C:\\data").unwrap();
        fs.create_file("C:\\data\\file", 1).unwrap();
        assert_eq!(fs.file_attributes("c:/DATA"), Ok(FileAttributes::DIRECTORY));
        assert_eq!(fs.file_attributes("C:\\data\\file"), Ok(FileAttributes::ARCHIVE));
        assert_eq!(fs.file_attributes("C:\\data\\nope"), Err(NativeError::FileNotFound));
        assert_eq!(fs.file_attributes("C:\\nope\\deeper"), Err(NativeError::PathNotFound));
        assert_eq!(fs.file_attributes("C:\\data\\file\\x"), Err(NativeError::PathNotFound));
        fs.fail_path("C:\\data", NativeError::AccessDenied);
        assert_eq!(fs.file_attributes("C:\\data"), Err(NativeError::AccessDenied));
    }

    #[test]
    fn test_unlink() {
        let fs = MemFileSystem::new();
        fs.mkdir_all("C:\\a\\b").unwrap();
        fs.create_file("C:\\a\\f", 1).unwrap();
        fs.shortcut("C:\\a\\s.lnk", "C:\\a\\b").unwrap();
        assert_eq!(fs.unlink("C:\\a\\b"), Err(NativeError::AccessDenied));
        fs.unlink("C:\\A\\F").unwrap();
        fs.unlink("C:\\a\\s.lnk").unwrap();
        assert_eq!(names(&fs, "C:\\a\\*.*"), vec![".", "..", "b"]);
        assert_eq!(fs.unlink("C:\\a\\f"), Err(NativeError::FileNotFound));
    }

    #[test]
    fn test_reparse_kinds() {
        let fs = MemFileSystem::new();
        fs.junction("C:\\j", "D:\\target").unwrap();
        let attrs = fs.file_attributes("C:\\j").unwrap();
        assert!(attrs.contains(FileAttributes::REPARSE_POINT | FileAttributes::DIRECTORY));
        let found = fs.find_files("C:\\*.*").unwrap().next().unwrap().unwrap();
        assert_eq!(found.reparse_tag, reparse::IO_REPARSE_TAG_MOUNT_POINT);
        assert_eq!(fs.read_reparse_point("C:\\"), Err(NativeError::NotAReparsePoint));
    }

    #[test]
    fn test_share_paging() {
        let fs = MemFileSystem::new();
        for name in ["A", "B", "C"] {
            fs.add_share(None, name, ShareKind::Disk);
        }
        let first = fs.enum_shares(None, 0).unwrap();
        assert_eq!(first.shares.len(), 2);
        assert_eq!(first.resume, Some(2));
        let second = fs.enum_shares(None, 2).unwrap();
        assert_eq!(second.shares.len(), 1);
        assert_eq!(second.resume, None);
        assert_eq!(fs.enum_shares(Some("far"), 0), Err(NativeError::Other(ERROR_BAD_NETPATH)));
    }

    #[test]
    fn test_relative_paths() {
        let fs = MemFileSystem::new();
        fs.mkdir("C:\\work").unwrap();
        fs.set_current_dir("C:\\work");
        assert_eq!(fs.full_path("sub\\..\\x").as_deref(), Some("C:\\work\\x"));
        assert_eq!(fs.full_path(".").as_deref(), Some("C:\\work"));
        assert_eq!(fs.full_path("\\top").as_deref(), Some("C:\\top"));
        assert_eq!(fs.full_path(""), None);
        assert_eq!(fs.current_drive(), Some('C'));
    }
}
