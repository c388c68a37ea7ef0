//! User namespace id maps
//!
//! The coordinator installs the child's maps from outside the user
//! namespace. With subordinate ids configured for the invoking user the
//! setuid helpers `newuidmap`/`newgidmap` map a whole range; otherwise the
//! caller's own uid/gid is mapped to root and nothing else.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use nix::unistd::{Gid, Uid, User};
use rootgate_core::process::lookup_binary;
use rootgate_core::{Error, ProcessId, Result};
use serde::{Deserialize, Serialize};

/// How the child's id maps are installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMapPolicy {
    /// Use subordinate ids when available, else fall back to `Single`
    #[default]
    Auto,
    /// Map only the caller's own uid/gid to root
    Single,
}

impl FromStr for IdMapPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "single" => Ok(Self::Single),
            other => Err(Error::invalid_config(format!("unknown id map policy: {other}"))),
        }
    }
}

/// One line of a `uid_map`/`gid_map`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    /// First id inside the namespace
    pub inside: u32,
    /// First id outside the namespace
    pub outside: u32,
    /// Number of ids
    pub count: u32,
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inside, self.outside, self.count)
    }
}

/// A subordinate id range from `/etc/subuid` or `/etc/subgid`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    /// First subordinate id
    pub start: u32,
    /// Number of ids
    pub count: u32,
}

/// Find the first range granted to `name` or to the numeric `id`
#[must_use]
pub fn parse_subid(content: &str, name: &str, id: u32) -> Option<SubIdRange> {
    let id = id.to_string();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split(':');
            let owner = fields.next()?;
            if owner != name && owner != id {
                return None;
            }
            let start = fields.next()?.parse().ok()?;
            let count = fields.next()?.parse().ok()?;
            (count > 0).then_some(SubIdRange { start, count })
        })
}

/// Maps for a caller with id `own` and an optional subordinate range
#[must_use]
pub fn plan(own: u32, range: Option<SubIdRange>) -> Vec<IdMapping> {
    let mut maps = vec![IdMapping {
        inside: 0,
        outside: own,
        count: 1,
    }];
    if let Some(range) = range {
        maps.push(IdMapping {
            inside: 1,
            outside: range.start,
            count: range.count,
        });
    }
    maps
}

/// Install uid and gid maps for the process `pid`
///
/// # Errors
/// Returns error if the maps cannot be written
pub async fn install(pid: ProcessId, policy: IdMapPolicy) -> Result<()> {
    let uid = Uid::current();
    let gid = Gid::current();

    if policy == IdMapPolicy::Auto {
        let name = User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_default();
        let subuid = read_range("/etc/subuid", &name, uid.as_raw()).await;
        let subgid = read_range("/etc/subgid", &name, gid.as_raw()).await;

        if let (Some(subuid), Some(subgid)) = (subuid, subgid) {
            match (lookup_binary("newuidmap"), lookup_binary("newgidmap")) {
                (Ok(newuidmap), Ok(newgidmap)) => {
                    run_helper(&newuidmap, pid, &plan(uid.as_raw(), Some(subuid))).await?;
                    run_helper(&newgidmap, pid, &plan(gid.as_raw(), Some(subgid))).await?;
                    tracing::debug!(
                        child_pid = %pid,
                        subuid_count = subuid.count,
                        subgid_count = subgid.count,
                        "Installed subordinate id maps"
                    );
                    return Ok(());
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Subordinate ids configured but helper missing");
                }
            }
        } else {
            tracing::debug!(user = %name, "No subordinate ids, mapping a single id");
        }
    }

    write_single(pid, uid.as_raw(), gid.as_raw()).await
}

async fn read_range(path: &str, name: &str, id: u32) -> Option<SubIdRange> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    parse_subid(&content, name, id)
}

async fn run_helper(binary: &Path, pid: ProcessId, maps: &[IdMapping]) -> Result<()> {
    let mut cmd = tokio::process::Command::new(binary);
    cmd.arg(pid.to_string());
    for map in maps {
        cmd.arg(map.inside.to_string())
            .arg(map.outside.to_string())
            .arg(map.count.to_string());
    }
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(Error::Namespace {
            message: format!(
                "{} failed: {}",
                binary.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

async fn write_single(pid: ProcessId, uid: u32, gid: u32) -> Result<()> {
    let proc_dir = format!("/proc/{pid}");
    let write = |file: &'static str, content: String| {
        let path = format!("{proc_dir}/{file}");
        async move {
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| Error::Namespace {
                    message: format!("cannot write {path}: {e}"),
                })
        }
    };

    // gid_map is only writable by an unprivileged caller once setgroups is denied
    write("setgroups", "deny".to_string()).await?;
    write("uid_map", format!("{}\n", plan(uid, None)[0])).await?;
    write("gid_map", format!("{}\n", plan(gid, None)[0])).await?;

    tracing::debug!(child_pid = %pid, uid, gid, "Installed single id maps");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBUID: &str = "\
# comment
alice:100000:65536
1001:200000:65536
bob:300000:0
";

    #[test]
    fn test_parse_subid_by_name() {
        assert_eq!(
            parse_subid(SUBUID, "alice", 1000),
            Some(SubIdRange {
                start: 100_000,
                count: 65536
            })
        );
    }

    #[test]
    fn test_parse_subid_by_uid() {
        let range = parse_subid(SUBUID, "carol", 1001).unwrap();
        assert_eq!(range.start, 200_000);
    }

    #[test]
    fn test_parse_subid_missing_or_empty() {
        assert_eq!(parse_subid(SUBUID, "dave", 1002), None);
        assert_eq!(parse_subid(SUBUID, "bob", 1003), None);
        assert_eq!(parse_subid("garbage", "alice", 1000), None);
    }

    #[test]
    fn test_plan() {
        let maps = plan(
            1000,
            Some(SubIdRange {
                start: 100_000,
                count: 65536,
            }),
        );
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].to_string(), "0 1000 1");
        assert_eq!(maps[1].to_string(), "1 100000 65536");

        assert_eq!(plan(1000, None).len(), 1);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("auto".parse::<IdMapPolicy>().unwrap(), IdMapPolicy::Auto);
        assert_eq!("single".parse::<IdMapPolicy>().unwrap(), IdMapPolicy::Single);
        assert!("all".parse::<IdMapPolicy>().is_err());
    }
}
