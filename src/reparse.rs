//! `REPARSE_DATA_BUFFER` decoding and target resolution.
//!
//! Layout (little endian):
//!
//! ```text
//!  0  u32  ReparseTag
//!  4  u16  ReparseDataLength
//!  6  u16  Reserved
//!  8  u16  SubstituteNameOffset   (bytes, relative to PathBuffer)
//! 10  u16  SubstituteNameLength   (bytes)
//! 12  u16  PrintNameOffset
//! 14  u16  PrintNameLength
//! 16  u32  Flags                  (symbolic links only)
//! 16/20    PathBuffer             (UTF-16)
//! ```

use thiserror::Error;

use crate::path::replace_last_component;
use crate::platform::DirectoryApi;

pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;
pub const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

const HEADER_LEN: usize = 8;
const MOUNT_POINT_PATH: usize = 16;
const SYMLINK_PATH: usize = 20;
const NT_PREFIX: &str = "\\??\\";
const NT_VOLUME_PREFIX: &str = "\\??\\Volume{";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReparseError {
    #[error("reparse buffer truncated")]
    Truncated,
    #[error("reparse tag {0:#010x} is not a Microsoft tag")]
    ForeignTag(u32),
    #[error("unsupported reparse tag {0:#010x}")]
    UnsupportedTag(u32),
    #[error("substitute name out of bounds")]
    NameOutOfBounds,
    #[error("substitute name too short")]
    NameTooShort,
    #[error("substitute name is not valid UTF-16")]
    InvalidName,
    #[error("volume {0} has no mount path")]
    UnmountedVolume(String),
}

/// Decoded reparse point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReparsePoint {
    SymbolicLink { substitute: String, relative: bool },
    /// Junction or volume mount point.
    MountPoint { substitute: String },
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, ReparseError> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ReparseError::Truncated)
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, ReparseError> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ReparseError::Truncated)
}

fn substitute_name(buf: &[u8], path_buffer: usize) -> Result<String, ReparseError> {
    let offset = read_u16(buf, 8)? as usize;
    let len = read_u16(buf, 10)? as usize;
    if len % 2 != 0 {
        return Err(ReparseError::InvalidName);
    }
    let start = path_buffer + offset;
    let bytes = buf.get(start..start + len).ok_or(ReparseError::NameOutOfBounds)?;
    let units: Vec<u16> =
        bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
    String::from_utf16(&units).map_err(|_| ReparseError::InvalidName)
}

pub fn decode(buf: &[u8]) -> Result<ReparsePoint, ReparseError> {
    let tag = read_u32(buf, 0)?;
    let data_len = read_u16(buf, 4)? as usize;
    let buf = buf.get(..HEADER_LEN + data_len).ok_or(ReparseError::Truncated)?;

    if tag & 0x8000_0000 == 0 {
        return Err(ReparseError::ForeignTag(tag));
    }
    match tag {
        IO_REPARSE_TAG_SYMLINK => {
            if read_u16(buf, 10)? < 4 {
                return Err(ReparseError::NameTooShort);
            }
            let flags = read_u32(buf, 16)?;
            Ok(ReparsePoint::SymbolicLink {
                substitute: substitute_name(buf, SYMLINK_PATH)?,
                relative: flags & SYMLINK_FLAG_RELATIVE != 0,
            })
        }
        IO_REPARSE_TAG_MOUNT_POINT => {
            if read_u16(buf, 10)? == 0 {
                return Err(ReparseError::NameTooShort);
            }
            Ok(ReparsePoint::MountPoint { substitute: substitute_name(buf, MOUNT_POINT_PATH)? })
        }
        other => Err(ReparseError::UnsupportedTag(other)),
    }
}

fn encode(tag: u32, flags: Option<u32>, substitute: &str, print: &str) -> Vec<u8> {
    let sub: Vec<u8> = substitute.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let prn: Vec<u8> = print.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let path_buffer = if flags.is_some() { SYMLINK_PATH } else { MOUNT_POINT_PATH };
    let data_len = path_buffer - HEADER_LEN + sub.len() + 2 + prn.len() + 2;

    let mut buf = Vec::with_capacity(HEADER_LEN + data_len);
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&(data_len as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(sub.len() as u16).to_le_bytes());
    buf.extend_from_slice(&((sub.len() + 2) as u16).to_le_bytes());
    buf.extend_from_slice(&(prn.len() as u16).to_le_bytes());
    if let Some(flags) = flags {
        buf.extend_from_slice(&flags.to_le_bytes());
    }
    buf.extend_from_slice(&sub);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&prn);
    buf.extend_from_slice(&[0, 0]);
    buf
}

/// Build a symbolic-link buffer, the way `CreateSymbolicLink` stores one.
pub fn encode_symlink(substitute: &str, relative: bool) -> Vec<u8> {
    let flags = if relative { SYMLINK_FLAG_RELATIVE } else { 0 };
    let print = substitute.strip_prefix(NT_PREFIX).unwrap_or(substitute);
    encode(IO_REPARSE_TAG_SYMLINK, Some(flags), substitute, print)
}

/// Build a junction or volume mount-point buffer.
pub fn encode_mount_point(substitute: &str) -> Vec<u8> {
    let print = substitute.strip_prefix(NT_PREFIX).unwrap_or(substitute);
    encode(IO_REPARSE_TAG_MOUNT_POINT, None, substitute, print)
}

/// Path that `link` (the path the reparse point was read from) redirects to.
pub fn resolve<D>(point: &ReparsePoint, link: &str, dirs: &D) -> Result<String, ReparseError>
where
    D: DirectoryApi + ?Sized,
{
    match point {
        ReparsePoint::SymbolicLink { substitute, relative: true } => {
            Ok(replace_last_component(link, substitute))
        }
        ReparsePoint::SymbolicLink { substitute, relative: false } => {
            Ok(substitute.strip_prefix(NT_PREFIX).unwrap_or(substitute).to_string())
        }
        ReparsePoint::MountPoint { substitute } if substitute.starts_with(NT_VOLUME_PREFIX) => {
            let volume = format!("\\\\?\\{}", &substitute[NT_PREFIX.len()..]);
            dirs.volume_path_names(&volume)
                .ok()
                .and_then(|paths| paths.into_iter().find(|p| !p.is_empty()))
                .ok_or(ReparseError::UnmountedVolume(volume))
        }
        ReparsePoint::MountPoint { substitute } => match substitute.strip_prefix(NT_PREFIX) {
            Some(absolute) => Ok(absolute.to_string()),
            None => Ok(replace_last_component(link, substitute)),
        },
    }
}
