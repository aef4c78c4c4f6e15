//! File name state machine
//!
//! Maps a logical file specification (a version plus version-specific
//! fields, packed into four words on the wire) onto an absolute path under
//! one of the configured base paths. Rendering is deterministic; the
//! component parser below recovers the logical fields from a rendered name
//! and backs the diagnostics output.
//!
//! Rendering errors indicate a programming error in the requesting block,
//! not a runtime I/O failure, and are fatal at the call site.

use std::fmt;
use std::path::{Path, MAIN_SEPARATOR};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::signal::{block_no, BlockRef};

/// Upper bound on a rendered path, matching the platform limit.
pub const PATH_MAX: usize = 4096;

const SEP: char = MAIN_SEPARATOR;

/// Selector for one of the configured filesystem roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BasePathSpec {
    FileSystem = 0,
    Backup = 1,
    DataFiles = 2,
    UndoFiles = 3,
}

/// The configured base-path table. Unset entries fall back to the
/// filesystem root on lookup.
#[derive(Debug, Clone, Default)]
pub struct BasePaths {
    paths: [Option<String>; 4],
}

impl BasePaths {
    /// Store a root. The stored form always ends with the separator.
    pub fn set(&mut self, spec: BasePathSpec, path: &Path) {
        let mut s = path.to_string_lossy().into_owned();
        if !s.ends_with(SEP) {
            s.push(SEP);
        }
        self.paths[spec as usize] = Some(s);
    }

    pub fn get(&self, spec: BasePathSpec) -> &str {
        match &self.paths[spec as usize] {
            Some(p) => p,
            None => self.paths[BasePathSpec::FileSystem as usize]
                .as_deref()
                .unwrap_or(""),
        }
    }

    pub fn is_set(&self, spec: BasePathSpec) -> bool {
        self.paths[spec as usize].is_some()
    }
}

/// File name suffix code carried in the logical file specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Suffix {
    Data = 0,
    FragLog = 1,
    LocLog = 2,
    FragList = 3,
    TableList = 4,
    SchemaLog = 5,
    Sysfile = 6,
    Log = 7,
    Ctl = 8,
}

impl Suffix {
    pub fn extension(self) -> &'static str {
        match self {
            Suffix::Data => ".Data",
            Suffix::FragLog => ".FragLog",
            Suffix::LocLog => ".LocLog",
            Suffix::FragList => ".FragList",
            Suffix::TableList => ".TableList",
            Suffix::SchemaLog => ".SchemaLog",
            Suffix::Sysfile => ".sysfile",
            Suffix::Log => ".log",
            Suffix::Ctl => ".ctl",
        }
    }
}

/// Sentinel meaning "component not present" for 32 bit fields.
pub const NO_VAL_32: u32 = 0xFFFF_FFFF;
/// Sentinel meaning "component not present" for 8 bit fields.
pub const NO_VAL_8: u32 = 0xFF;
/// Sentinel meaning "no count" in version 2 names.
pub const NO_COUNT: u32 = 0xFFFF;

/// Logical file specification, version 1 through 6.
///
/// Version 3 rejects `disk == 0xFF` as invalid while version 1 treats the
/// same value as "omit the disk component". The asymmetry is load-bearing
/// for existing on-disk layouts and is kept as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSpec {
    V1 {
        disk: u32,
        table: u32,
        fragment: u32,
        s: u32,
        p: u32,
        suffix: Suffix,
    },
    V2 {
        sequence: u32,
        node_id: u32,
        part: u32,
        total_parts: u32,
        count: u32,
        suffix: Suffix,
    },
    V3 {
        disk: u32,
        suffix: Suffix,
    },
    /// Caller-supplied name, appended to the selected base path unless the
    /// name is absolute. No extension is appended.
    V4 {
        base: BasePathSpec,
    },
    V5 {
        table: u32,
        lcp_no: u32,
        fragment: u32,
        suffix: Suffix,
    },
    /// The selected base path itself.
    V6 {
        base: BasePathSpec,
    },
}

/// Rendering failures. All are parameter errors in the requesting block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameError {
    UnknownVersion,
    UnknownSuffix,
    InvalidDiskSpec,
    NameTooLong,
    EmptyName,
    MissingName,
    NoBlockName,
}

impl fmt::Display for FilenameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FilenameError::UnknownVersion => "unknown file spec version",
            FilenameError::UnknownSuffix => "unknown file suffix",
            FilenameError::InvalidDiskSpec => "invalid disk specification",
            FilenameError::NameTooLong => "file name is too long",
            FilenameError::EmptyName => "file name is empty",
            FilenameError::MissingName => "file name section is missing",
            FilenameError::NoBlockName => "no name for requesting block",
        };
        f.write_str(msg)
    }
}

impl FileSpec {
    /// Pack into the four-word wire form.
    pub fn encode(&self) -> [u32; 4] {
        match *self {
            FileSpec::V1 {
                disk,
                table,
                fragment,
                s,
                p,
                suffix,
            } => [
                table,
                fragment,
                s,
                1 << 24 | (suffix as u32) << 16 | (p & 0xFF) << 8 | (disk & 0xFF),
            ],
            FileSpec::V2 {
                sequence,
                node_id,
                part,
                total_parts,
                count,
                suffix,
            } => [
                sequence,
                node_id,
                part << 16 | (total_parts & 0xFFFF),
                2 << 24 | (suffix as u32) << 16 | (count & 0xFFFF),
            ],
            FileSpec::V3 { disk, suffix } => {
                [0, 0, 0, 3 << 24 | (suffix as u32) << 16 | (disk & 0xFF)]
            }
            FileSpec::V4 { base } => [0, 0, 0, 4 << 24 | (base as u32) << 16],
            FileSpec::V5 {
                table,
                lcp_no,
                fragment,
                suffix,
            } => [table, lcp_no, fragment, 5 << 24 | (suffix as u32) << 16],
            FileSpec::V6 { base } => [0, 0, 0, 6 << 24 | (base as u32) << 16],
        }
    }

    /// Unpack the four-word wire form.
    pub fn decode(words: [u32; 4]) -> Result<FileSpec, FilenameError> {
        let version = words[3] >> 24;
        let suffix = || {
            Suffix::try_from(((words[3] >> 16) & 0xFF) as u8)
                .map_err(|_| FilenameError::UnknownSuffix)
        };
        let base = || {
            BasePathSpec::try_from(((words[3] >> 16) & 0xFF) as u8)
                .map_err(|_| FilenameError::UnknownVersion)
        };
        match version {
            1 => Ok(FileSpec::V1 {
                disk: words[3] & 0xFF,
                table: words[0],
                fragment: words[1],
                s: words[2],
                p: (words[3] >> 8) & 0xFF,
                suffix: suffix()?,
            }),
            2 => Ok(FileSpec::V2 {
                sequence: words[0],
                node_id: words[1],
                part: words[2] >> 16,
                total_parts: words[2] & 0xFFFF,
                count: words[3] & 0xFFFF,
                suffix: suffix()?,
            }),
            3 => Ok(FileSpec::V3 {
                disk: words[3] & 0xFF,
                suffix: suffix()?,
            }),
            4 => Ok(FileSpec::V4 { base: base()? }),
            5 => Ok(FileSpec::V5 {
                table: words[0],
                lcp_no: words[1],
                fragment: words[2],
                suffix: suffix()?,
            }),
            6 => Ok(FileSpec::V6 { base: base()? }),
            _ => Err(FilenameError::UnknownVersion),
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            FileSpec::V1 { .. } => 1,
            FileSpec::V2 { .. } => 2,
            FileSpec::V3 { .. } => 3,
            FileSpec::V4 { .. } => 4,
            FileSpec::V5 { .. } => 5,
            FileSpec::V6 { .. } => 6,
        }
    }
}

/// A rendered file name, kept for the lifetime of the file it names.
#[derive(Debug, Clone, Default)]
pub struct Filename {
    name: String,
    base_off: usize,
    base: BasePathSpecSlot,
}

// Default for the slot only; a real Filename always records its base.
#[derive(Debug, Clone, Copy)]
struct BasePathSpecSlot(BasePathSpec);

impl Default for BasePathSpecSlot {
    fn default() -> Self {
        BasePathSpecSlot(BasePathSpec::FileSystem)
    }
}

impl Filename {
    /// Render `spec` into an absolute name under the matching base path.
    ///
    /// `dir` trims the rendered name to its containing directory (versions
    /// other than 4). `name` carries the caller-supplied string for
    /// version 4 specs.
    pub fn set(
        paths: &BasePaths,
        block_ref: BlockRef,
        spec: &FileSpec,
        dir: bool,
        name: Option<&str>,
    ) -> Result<Filename, FilenameError> {
        use std::fmt::Write;

        let base_spec = match spec {
            FileSpec::V2 { .. } => BasePathSpec::Backup,
            FileSpec::V4 { base } | FileSpec::V6 { base } => *base,
            _ => BasePathSpec::FileSystem,
        };
        let base = paths.get(base_spec);
        let mut out = String::from(base);
        let base_off = out.len();

        match *spec {
            FileSpec::V1 {
                disk,
                table,
                fragment,
                s,
                p,
                suffix,
            } => {
                if disk < NO_VAL_8 {
                    let _ = write!(out, "D{disk}{SEP}");
                }
                let block =
                    block_name(block_no(block_ref)).ok_or(FilenameError::NoBlockName)?;
                let _ = write!(out, "{block}{SEP}");
                if table < NO_VAL_32 {
                    let _ = write!(out, "T{table}{SEP}");
                }
                if fragment < NO_VAL_32 {
                    let _ = write!(out, "F{fragment}{SEP}");
                }
                if s < NO_VAL_32 {
                    let _ = write!(out, "S{s}");
                }
                if p < NO_VAL_8 {
                    let _ = write!(out, "P{p}");
                }
                out.push_str(suffix.extension());
            }
            FileSpec::V2 {
                sequence,
                node_id,
                part,
                total_parts,
                count,
                suffix,
            } => {
                let _ = write!(out, "BACKUP{SEP}BACKUP-{sequence}{SEP}");
                if part != 0 {
                    let _ = write!(
                        out,
                        "BACKUP-{sequence}-PART-{part}-OF-{total_parts}{SEP}"
                    );
                }
                if count == NO_COUNT {
                    let _ = write!(out, "BACKUP-{sequence}.{node_id}");
                } else {
                    let _ = write!(out, "BACKUP-{sequence}-{count}.{node_id}");
                }
                out.push_str(suffix.extension());
            }
            FileSpec::V3 { disk, suffix } => {
                if disk == NO_VAL_8 {
                    return Err(FilenameError::InvalidDiskSpec);
                }
                let _ = write!(out, "D{disk}");
                out.push_str(suffix.extension());
            }
            FileSpec::V4 { .. } => {
                let name = name.ok_or(FilenameError::MissingName)?;
                if name.is_empty() {
                    return Err(FilenameError::EmptyName);
                }
                if name.len() > PATH_MAX {
                    return Err(FilenameError::NameTooLong);
                }
                let base_off = if name.starts_with(SEP) {
                    out = String::from(name);
                    0
                } else {
                    out.push_str(name);
                    base_off
                };
                if out.len() > PATH_MAX {
                    return Err(FilenameError::NameTooLong);
                }
                return Ok(Filename {
                    name: out,
                    base_off,
                    base: BasePathSpecSlot(base_spec),
                });
            }
            FileSpec::V5 {
                table,
                lcp_no,
                fragment,
                suffix,
            } => {
                let _ = write!(out, "LCP{SEP}{lcp_no}{SEP}T{table}F{fragment}");
                out.push_str(suffix.extension());
            }
            FileSpec::V6 { .. } => {}
        }

        if out.len() > PATH_MAX {
            return Err(FilenameError::NameTooLong);
        }

        if dir {
            if let Some(pos) = out.rfind(SEP) {
                out.truncate(pos);
            }
        }

        Ok(Filename {
            name: out,
            base_off,
            base: BasePathSpecSlot(base_spec),
        })
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.name)
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The portion after the base path, used in diagnostics.
    pub fn base_name(&self) -> &str {
        &self.name[self.base_off..]
    }

    pub fn base_path_spec(&self) -> BasePathSpec {
        self.base.0
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Directory prefixes between the base path and the leaf, shortest
    /// first. Feeding these to mkdir realizes the missing intermediate
    /// directories.
    pub fn directory_levels(&self) -> impl Iterator<Item = &Path> + '_ {
        let name = &self.name;
        let start = self.base_off;
        name[start..]
            .char_indices()
            .filter(move |(_, c)| *c == SEP)
            .map(move |(i, _)| Path::new(&name[..start + i]))
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Logical fields recovered from a rendered name by [`parse_components`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedName {
    V1 {
        disk: Option<u32>,
        block: String,
        table: Option<u32>,
        fragment: Option<u32>,
        s: Option<u32>,
        p: Option<u32>,
    },
    V2 {
        sequence: u32,
        part: Option<(u32, u32)>,
        count: Option<u32>,
        node_id: u32,
    },
    V3 {
        disk: u32,
    },
    V5 {
        table: u32,
        lcp_no: u32,
        fragment: u32,
    },
}

fn strip_prefixed_num<'a>(s: &'a str, prefix: &str) -> Option<(u32, &'a str)> {
    let rest = s.strip_prefix(prefix)?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some((rest[..end].parse().ok()?, &rest[end..]))
}

/// Recover the logical fields from the post-base portion of a rendered
/// name. Returns `None` for names this block did not render.
pub fn parse_components(base_name: &str) -> Option<ParsedName> {
    let mut parts: Vec<&str> = base_name.split(SEP).collect();
    let leaf = parts.pop()?;
    let stem = leaf.rsplit_once('.').map(|(s, _)| s).unwrap_or(leaf);

    if parts.first() == Some(&"BACKUP") {
        // BACKUP/BACKUP-<seq>/[BACKUP-<seq>-PART-<p>-OF-<tp>/]BACKUP-<seq>[-<count>].<node>
        let (sequence, _) = strip_prefixed_num(parts.get(1)?, "BACKUP-")?;
        let part = match parts.get(2) {
            Some(dir) => {
                let (_, rest) = strip_prefixed_num(dir, "BACKUP-")?;
                let (p, rest) = strip_prefixed_num(rest, "-PART-")?;
                let (tp, _) = strip_prefixed_num(rest, "-OF-")?;
                Some((p, tp))
            }
            None => None,
        };
        let (_, rest) = strip_prefixed_num(stem, "BACKUP-")?;
        let count = match strip_prefixed_num(rest, "-") {
            Some((c, rest)) => {
                let (node_id, _) = strip_prefixed_num(rest, ".")?;
                return Some(ParsedName::V2 {
                    sequence,
                    part,
                    count: Some(c),
                    node_id,
                });
            }
            None => None,
        };
        let (node_id, _) = strip_prefixed_num(rest, ".")?;
        return Some(ParsedName::V2 {
            sequence,
            part,
            count,
            node_id,
        });
    }

    if parts.first() == Some(&"LCP") {
        let lcp_no: u32 = parts.get(1)?.parse().ok()?;
        let (table, rest) = strip_prefixed_num(stem, "T")?;
        let (fragment, _) = strip_prefixed_num(rest, "F")?;
        return Some(ParsedName::V5 {
            table,
            lcp_no,
            fragment,
        });
    }

    if parts.is_empty() {
        let (disk, _) = strip_prefixed_num(stem, "D")?;
        return Some(ParsedName::V3 { disk });
    }

    // Version 1: [D<d>/]<block>/[T<t>/][F<f>/]S<s>[P<p>].<ext>
    let mut it = parts.into_iter().peekable();
    let disk = match it.peek().and_then(|p| strip_prefixed_num(p, "D")) {
        Some((d, "")) => {
            it.next();
            Some(d)
        }
        _ => None,
    };
    let block = it.next()?.to_string();
    let mut table = None;
    let mut fragment = None;
    for comp in it {
        if let Some((t, "")) = strip_prefixed_num(comp, "T") {
            table = Some(t);
        } else if let Some((f, "")) = strip_prefixed_num(comp, "F") {
            fragment = Some(f);
        } else {
            return None;
        }
    }
    let (s, p) = match strip_prefixed_num(stem, "S") {
        Some((s, rest)) => match strip_prefixed_num(rest, "P") {
            Some((p, "")) => (Some(s), Some(p)),
            None if rest.is_empty() => (Some(s), None),
            _ => return None,
        },
        None => (None, None),
    };
    Some(ParsedName::V1 {
        disk,
        block,
        table,
        fragment,
        s,
        p,
    })
}

/// Block names for the version 1 directory segment, by block number.
pub fn block_name(block: u32) -> Option<&'static str> {
    Some(match block {
        244 => "BACKUP",
        245 => "DBTC",
        246 => "DBDIH",
        247 => "DBLQH",
        248 => "DBACC",
        249 => "DBTUP",
        250 => "DBDICT",
        251 => "NDBCNTR",
        252 => "QMGR",
        253 => "NDBFS",
        254 => "CMVMI",
        255 => "TRIX",
        256 => "DBUTIL",
        257 => "SUMA",
        258 => "DBTUX",
        259 => "TSMAN",
        260 => "LGMAN",
        261 => "PGMAN",
        262 => "RESTORE",
        263 => "DBINFO",
        264 => "DBSPJ",
        _ => return None,
    })
}
