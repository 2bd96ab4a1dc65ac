//! Conflict resolution between cached records and server copies.

use crate::api::RemoteRecord;
use crate::database::CachedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a pending local edit is reconciled with a changed server copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The server copy overwrites the local edit
    #[default]
    ServerWins,
    /// The local edit is kept and uploaded again
    ClientWins,
    /// The local edit is kept and the conflict is recorded for a person to resolve
    Manual,
}

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the server copy into the cache.
    AcceptRemote,
    /// Keep the cached row as it is.
    KeepLocal,
    /// Keep the cached row and record a conflict.
    Conflict,
    /// The server copy is older than what we have already seen.
    RejectRollback,
}

/// Sync-relevant view of the latest cached version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVersion {
    pub server_version: i64,
    pub last_modified: DateTime<Utc>,
    pub pending: bool,
}

impl From<&CachedRecord> for LocalVersion {
    fn from(row: &CachedRecord) -> Self {
        Self {
            server_version: row.server_version,
            last_modified: row.last_modified,
            pending: row.pending,
        }
    }
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a server copy against the latest local version.
    ///
    /// Rules:
    /// 1. A lower `server_version` than already seen is a rollback and is rejected.
    /// 2. A pending local edit conflicts only if the server changed since the
    ///    last sync; the policy decides the outcome.
    /// 3. Otherwise a higher `server_version` wins, and on equal versions the
    ///    newer timestamp wins, ties keeping local.
    pub fn resolve(policy: ConflictPolicy, local: LocalVersion, remote: &RemoteRecord) -> Resolution {
        if remote.server_version < local.server_version {
            return Resolution::RejectRollback;
        }

        if local.pending {
            if remote.server_version == local.server_version {
                return Resolution::KeepLocal;
            }
            return match policy {
                ConflictPolicy::ServerWins => Resolution::AcceptRemote,
                ConflictPolicy::ClientWins => Resolution::KeepLocal,
                ConflictPolicy::Manual => Resolution::Conflict,
            };
        }

        if remote.server_version > local.server_version
            || remote.updated_at > local.last_modified
        {
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }

    /// Check if a server copy should be accepted when there is no local copy.
    pub fn accept_new(remote: &RemoteRecord) -> bool {
        remote.server_version > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_record;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn remote(server_version: i64, updated_at: i64) -> RemoteRecord {
        RemoteRecord {
            record: sample_record("p1"),
            server_version,
            updated_at: at(updated_at),
        }
    }

    fn local(server_version: i64, last_modified: i64, pending: bool) -> LocalVersion {
        LocalVersion {
            server_version,
            last_modified: at(last_modified),
            pending,
        }
    }

    #[test]
    fn higher_version_wins() {
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::ServerWins, local(2, 2000, false), &remote(3, 1000)),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn same_version_newer_timestamp_wins() {
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::ServerWins, local(2, 1000, false), &remote(2, 2000)),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn same_version_same_timestamp_keeps_local() {
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::ServerWins, local(2, 1000, false), &remote(2, 1000)),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn rollback_to_older_version_rejected() {
        // Older version, even with a newer timestamp
        for policy in [ConflictPolicy::ServerWins, ConflictPolicy::ClientWins, ConflictPolicy::Manual] {
            assert_eq!(
                ConflictResolver::resolve(policy, local(3, 1000, true), &remote(1, 5000)),
                Resolution::RejectRollback
            );
        }
    }

    #[test]
    fn pending_edit_against_unchanged_server_keeps_local() {
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::ServerWins, local(2, 1000, true), &remote(2, 5000)),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn policies_decide_real_conflicts() {
        let local = local(2, 1000, true);
        let remote = remote(3, 900);
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::ServerWins, local, &remote),
            Resolution::AcceptRemote
        );
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::ClientWins, local, &remote),
            Resolution::KeepLocal
        );
        assert_eq!(
            ConflictResolver::resolve(ConflictPolicy::Manual, local, &remote),
            Resolution::Conflict
        );
    }

    #[test]
    fn accept_new_requires_server_version() {
        assert!(ConflictResolver::accept_new(&remote(1, 1000)));
        assert!(!ConflictResolver::accept_new(&remote(0, 1000)));
    }

    #[test]
    fn policy_serde_names() {
        let policy: ConflictPolicy = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(policy, ConflictPolicy::Manual);
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::ServerWins);
    }
}
