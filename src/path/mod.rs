// Win32 path handling shared by the directory emulation and the in-memory volume.

use core::fmt;
use core::hash::{Hash, Hasher};

pub const PATH_SEP: char = '/';
pub const PATH_SEP2: char = '\\';

/// Characters that end a UNC server name without being a separator.
const UNC_INVALID: &[char] = &['*', '?', '|', '<', '>', '"'];

pub fn is_sep(c: char) -> bool {
    c == PATH_SEP || c == PATH_SEP2
}

/// Backslash delimited Windows path.
///
/// Equality and hashing ignore ASCII case, the way the Win32 namespace does.
#[derive(Clone)]
pub struct WinPathBuf {
    inner: String,
}

impl PartialEq for WinPathBuf {
    fn eq(&self, other: &Self) -> bool {
        self.inner.eq_ignore_ascii_case(&other.inner)
    }
}

impl Eq for WinPathBuf {}

impl Hash for WinPathBuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Debug for WinPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WinPathBuf").field(&self.inner).finish()
    }
}

impl fmt::Display for WinPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl WinPathBuf {
    pub fn from<S: Into<String>>(s: S) -> Self {
        Self { inner: to_backslashes(&s.into()) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// `X:\...` or `\\server\...`.
    pub fn is_absolute(&self) -> bool {
        drive_letter(&self.inner).is_some() && self.inner[2..].starts_with(PATH_SEP2)
            || self.inner.starts_with("\\\\")
    }

    /// Length of the root prefix (`X:\` or `\\server\share\`).
    fn root_len(&self) -> usize {
        if drive_letter(&self.inner).is_some() {
            return if self.inner[2..].starts_with(PATH_SEP2) { 3 } else { 2 };
        }
        if let Some(rest) = self.inner.strip_prefix("\\\\") {
            let mut seps = rest.match_indices(PATH_SEP2).map(|(i, _)| i + 2);
            let _server = seps.next();
            return match seps.next() {
                Some(share_end) => share_end + 1,
                None => self.inner.len(),
            };
        }
        0
    }

    pub fn join(&self, other: &str) -> WinPathBuf {
        let other = WinPathBuf::from(other);
        if other.is_absolute() {
            return other;
        }
        let mut joined = self.inner.clone();
        if !joined.ends_with(PATH_SEP2) && !joined.is_empty() {
            joined.push(PATH_SEP2);
        }
        joined.push_str(&other.inner);
        WinPathBuf { inner: joined }
    }

    pub fn file_name(&self) -> Option<&str> {
        let root = self.root_len();
        let trimmed = self.inner.trim_end_matches(PATH_SEP2);
        if trimmed.len() <= root {
            return None;
        }
        trimmed.rsplit_once(PATH_SEP2).map(|(_, name)| name).or(Some(trimmed))
    }

    pub fn parent(&self) -> Option<WinPathBuf> {
        let root = self.root_len();
        let trimmed = self.inner.trim_end_matches(PATH_SEP2);
        if trimmed.len() <= root {
            return None;
        }
        let idx = trimmed.rfind(PATH_SEP2)?;
        if idx < root {
            Some(WinPathBuf { inner: self.inner[..root].to_string() })
        } else {
            Some(WinPathBuf { inner: trimmed[..idx].to_string() })
        }
    }

    /// Collapse `.` and `..` components; the root is never popped.
    pub fn normalize(&self) -> WinPathBuf {
        let root_len = self.root_len();
        let (root, rest) = self.inner.split_at(root_len.min(self.inner.len()));
        let mut parts: Vec<&str> = Vec::new();
        for part in rest.split(PATH_SEP2) {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        let mut inner = root.to_string();
        if !inner.is_empty() && !inner.ends_with(PATH_SEP2) && !parts.is_empty() {
            inner.push(PATH_SEP2);
        }
        inner.push_str(&parts.join("\\"));
        if parts.is_empty() && inner.starts_with("\\\\") && !inner.ends_with(PATH_SEP2) {
            inner.push(PATH_SEP2);
        }
        WinPathBuf { inner }
    }

    /// Lower-cased form used as a lookup key.
    pub fn key(&self) -> String {
        self.inner.to_ascii_lowercase()
    }
}

/// Drive letter of an `X:` prefix.
pub fn drive_letter(path: &str) -> Option<char> {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => Some(letter.to_ascii_uppercase()),
        _ => None,
    }
}

pub fn to_backslashes(path: &str) -> String {
    path.replace(PATH_SEP, "\\")
}

/// Best-effort DOS form when the full-path query fails: forward slashes
/// become backslashes and a trailing backslash is dropped unless the path is
/// a drive root (`c:\`) or a lone separator.
pub fn dos_path(path: &str) -> String {
    let mut converted = to_backslashes(path);
    let len = converted.chars().count();
    let drive_root = len == 3 && drive_letter(&converted).is_some();
    if converted.ends_with(PATH_SEP2) && len > 1 && !drive_root {
        converted.pop();
    }
    converted
}

/// Strip every trailing backslash and append the `\*.*` wildcard.
pub fn search_pattern(dir: &str) -> String {
    let mut pattern = dir.trim_end_matches(PATH_SEP2).to_string();
    pattern.push_str("\\*.*");
    pattern
}

/// Replace the last component of `original` by `replacement`, keeping the
/// delimiter. Parent references in `replacement` are not interpreted.
pub fn replace_last_component(original: &str, replacement: &str) -> String {
    match original.rfind(is_sep) {
        Some(idx) => format!("{}{}", &original[..=idx], replacement),
        None => replacement.to_string(),
    }
}

/// Whether the last component carries a `.lnk` extension.
pub fn is_shortcut(path: &str) -> bool {
    let name = path.rsplit(is_sep).next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.eq_ignore_ascii_case("lnk"),
        None => false,
    }
}

/// Server-name length when `path` is a UNC path (`//server[/...]`).
pub fn unc_valid(path: &str) -> Option<usize> {
    let mut chars = path.chars();
    let first = chars.next()?;
    if !is_sep(first) || chars.next() != Some(first) {
        return None;
    }
    let rest = &path[2..];
    let namelen = match rest.find(|c: char| is_sep(c) || UNC_INVALID.contains(&c)) {
        Some(idx) if is_sep(rest[idx..].chars().next()?) => idx,
        Some(_) => return None,
        None => rest.len(),
    };
    (namelen > 0).then_some(namelen)
}

/// A UNC path naming only a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncRoot {
    pub server: String,
    /// The server is this machine.
    pub local: bool,
}

/// Recognize `//server` or `//server/`. `local_names` lists the names that
/// refer to this machine besides `computer_name`.
pub fn unc_root(path: &str, computer_name: Option<&str>, local_names: &[String]) -> Option<UncRoot> {
    let namelen = unc_valid(path)?;
    let server = &path[2..2 + namelen];
    let mut tail = path[2 + namelen..].chars();
    match (tail.next(), tail.next()) {
        (None, _) => {}
        (Some(sep), None) if is_sep(sep) => {}
        _ => return None,
    }
    let local = computer_name.map_or(false, |name| name.eq_ignore_ascii_case(server))
        || local_names.iter().any(|name| name.eq_ignore_ascii_case(server));
    Some(UncRoot { server: server.to_string(), local })
}

/// Root of the volume holding `directory`: `\\server\share\`, `\\server\`
/// or `X:\`, falling back to `current_drive` for relative paths.
pub fn volume_root(directory: &str, current_drive: Option<char>) -> Option<String> {
    if let Some(namelen) = unc_valid(directory) {
        let mut root = String::from("\\\\");
        root.push_str(&directory[2..2 + namelen]);
        root.push(PATH_SEP2);
        let rest = &directory[2 + namelen..];
        let share = rest.trim_start_matches(is_sep);
        if !share.is_empty() && rest.len() != share.len() {
            let component = share.split(is_sep).next().unwrap_or_default();
            root.push_str(component);
            root.push(PATH_SEP2);
        }
        return Some(root);
    }
    let drive = drive_letter(directory).or(current_drive)?;
    Some(format!("{drive}:\\"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_path() {
        assert_eq!(dos_path("c:/data/"), "c:\\data");
        assert_eq!(dos_path("c:/"), "c:\\");
        assert_eq!(dos_path("/"), "\\");
        assert_eq!(dos_path("name/sub"), "name\\sub");
    }

    #[test]
    fn test_search_pattern() {
        assert_eq!(search_pattern("C:\\data\\\\"), "C:\\data\\*.*");
        assert_eq!(search_pattern("C:\\"), "C:\\*.*");
    }

    #[test]
    fn test_unc_valid() {
        assert_eq!(unc_valid("//server"), Some(6));
        assert_eq!(unc_valid("\\\\server\\share"), Some(6));
        assert_eq!(unc_valid("/\\server"), None);
        assert_eq!(unc_valid("//"), None);
        assert_eq!(unc_valid("//ser*ver"), None);
        assert_eq!(unc_valid("c:/server"), None);
    }

    #[test]
    fn test_unc_root() {
        let aliases = vec!["localhost".to_string()];
        let root = unc_root("//WORKSTATION/", Some("workstation"), &aliases).unwrap();
        assert!(root.local);
        assert_eq!(root.server, "WORKSTATION");

        assert!(unc_root("//localhost", Some("box"), &aliases).unwrap().local);
        assert!(!unc_root("//remote", Some("box"), &aliases).unwrap().local);
        assert_eq!(unc_root("//remote/share", Some("box"), &aliases), None);
        assert_eq!(unc_root("//remote//", Some("box"), &aliases), None);
    }

    #[test]
    fn test_volume_root() {
        assert_eq!(volume_root("d:\\x\\y", Some('C')).as_deref(), Some("D:\\"));
        assert_eq!(volume_root("x\\y", Some('C')).as_deref(), Some("C:\\"));
        assert_eq!(volume_root("x", None), None);
        assert_eq!(
            volume_root("\\\\srv\\share\\dir", None).as_deref(),
            Some("\\\\srv\\share\\")
        );
        assert_eq!(volume_root("//srv", None).as_deref(), Some("\\\\srv\\"));
    }

    #[test]
    fn test_replace_last_component() {
        assert_eq!(replace_last_component("c:\\a\\link", "target"), "c:\\a\\target");
        assert_eq!(replace_last_component("link", "target"), "target");
    }

    #[test]
    fn test_is_shortcut() {
        assert!(is_shortcut("c:\\desk\\Docs.LNK"));
        assert!(!is_shortcut("c:\\desk.lnk\\docs"));
        assert!(!is_shortcut("c:\\desk\\docs"));
    }

    #[test]
    fn test_winpath_navigation() {
        let path = WinPathBuf::from("C:/Data/sub");
        assert_eq!(path.as_str(), "C:\\Data\\sub");
        assert_eq!(path.file_name(), Some("sub"));
        assert_eq!(path.parent().unwrap().as_str(), "C:\\Data");
        assert_eq!(path.parent().unwrap().parent().unwrap().as_str(), "C:\\");
        assert_eq!(WinPathBuf::from("C:\\").parent(), None);
        assert_eq!(path, WinPathBuf::from("c:\\data\\SUB"));
    }

    #[test]
    fn test_winpath_normalize() {
        assert_eq!(WinPathBuf::from("C:\\a\\.\\b\\..\\c\\").normalize().as_str(), "C:\\a\\c");
        assert_eq!(WinPathBuf::from("C:\\..\\..").normalize().as_str(), "C:\\");
        assert_eq!(
            WinPathBuf::from("\\\\srv\\share\\x\\..").normalize().as_str(),
            "\\\\srv\\share\\"
        );
    }
}
