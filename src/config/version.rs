//! Server versions and version-bounded SQL variants.
//!
//! Versions are encoded the way `server_version_num` reports them:
//! `major * 10000 + minor * 100 + patch`, so `9.6.3` is `90603`. From
//! PostgreSQL 10 on the second component is the patch level, so `10.5` is
//! `100005`.

use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::fmt;

/// A detected (or configured) server version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion(i64);

impl ServerVersion {
    /// Sentinel for "no version detected / not applicable".
    pub const NONE: Self = Self(-1);

    /// Unbounded side of a version range.
    pub const UNBOUNDED: Self = Self(0);

    #[must_use]
    pub const fn new(num: i64) -> Self {
        Self(num)
    }

    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    /// Parse a dotted version string (`9.6.3`, `9.6`, `10.5`, `12`).
    ///
    /// Returns [`ServerVersion::NONE`] when the string is not a version.
    #[must_use]
    pub fn parse(version: &str) -> Self {
        static RE: OnceCell<Regex> = OnceCell::new();
        let re = RE.get_or_init(|| {
            #[allow(clippy::expect_used)]
            Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?$").expect("Invalid regex")
        });

        let Some(caps) = re.captures(version.trim()) else {
            return Self::NONE;
        };

        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<i64>().ok())
        };

        let Some(major) = part(1) else {
            return Self::NONE;
        };

        let minor = part(2).unwrap_or(0);
        let num = if major > 9 {
            major
                .checked_mul(10000)
                .and_then(|n| n.checked_add(minor))
        } else {
            minor
                .checked_mul(100)
                .and_then(|n| n.checked_add(major * 10000))
                .and_then(|n| n.checked_add(part(3).unwrap_or(0)))
        };

        num.map_or(Self::NONE, Self)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        write!(
            f,
            "{}.{}.{}",
            self.0 / 10000,
            (self.0 / 100) % 100,
            self.0 % 100
        )
    }
}

/// One SQL text valid for versions in `[min, max)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedSql {
    pub min: ServerVersion,
    pub max: ServerVersion,
    pub sql: String,
}

impl VersionedSql {
    /// A variant valid for every version.
    #[must_use]
    pub fn unbounded(sql: impl Into<String>) -> Self {
        Self {
            min: ServerVersion::UNBOUNDED,
            max: ServerVersion::UNBOUNDED,
            sql: sql.into(),
        }
    }

    /// Build a variant from a range key such as `9.4-10`, `10-` or `-9.4`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key has no `-` or a bound is not a version.
    pub fn from_range(key: &str, sql: impl Into<String>) -> Result<Self> {
        let (min, max) = key
            .split_once('-')
            .ok_or_else(|| anyhow!("version range {key:?} must look like MIN-MAX, MIN- or -MAX"))?;

        let bound = |s: &str| -> Result<ServerVersion> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(ServerVersion::UNBOUNDED);
            }
            let v = ServerVersion::parse(s);
            if v.is_none() {
                return Err(anyhow!("invalid version {s:?} in range {key:?}"));
            }
            Ok(v)
        };

        Ok(Self {
            min: bound(min)?,
            max: bound(max)?,
            sql: sql.into(),
        })
    }

    const fn is_unbounded(&self) -> bool {
        self.min.0 == 0 && self.max.0 == 0
    }

    /// Whether `version` falls in `[min, max)`; a zero bound is open.
    #[must_use]
    pub fn matches(&self, version: ServerVersion) -> bool {
        (version >= self.min || self.min == ServerVersion::UNBOUNDED)
            && (version < self.max || self.max == ServerVersion::UNBOUNDED)
    }
}

/// Pick the SQL text to run against `version`.
///
/// With the "no version" sentinel, or a single unbounded variant, the first
/// variant is used. Otherwise the first variant whose range contains
/// `version` wins. `None` means no variant applies.
#[must_use]
pub fn resolve(variants: &[VersionedSql], version: ServerVersion) -> Option<&str> {
    let first = variants.first()?;

    if version.is_none() || (variants.len() == 1 && first.is_unbounded()) {
        return Some(&first.sql);
    }

    variants
        .iter()
        .find(|v| v.matches(version))
        .map(|v| v.sql.as_str())
}
