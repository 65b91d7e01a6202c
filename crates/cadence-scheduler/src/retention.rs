use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::{error::Result, store::Store};

/// Delete reported, finished instances older than each definition's retention.
///
/// A retention of zero days keeps history forever. Returns the number of
/// instances deleted across all definitions.
pub fn prune_expired(store: &dyn Store, now: DateTime<Utc>) -> Result<usize> {
    let mut total = 0;
    for definition in store.list_definitions()? {
        if definition.retention_days == 0 {
            continue;
        }
        // Nothing can be older than a cutoff before chrono's earliest date.
        let Some(cutoff) = Duration::try_days(i64::from(definition.retention_days))
            .and_then(|age| now.checked_sub_signed(age))
        else {
            continue;
        };
        let deleted = store.delete_expired(&definition.id, cutoff)?;
        if deleted > 0 {
            info!(job = %definition.key, deleted, "expired runs removed");
        }
        total += deleted;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{fixtures, SqliteStore};

    #[test]
    fn old_reported_runs_are_removed() {
        let store = SqliteStore::in_memory().unwrap();
        let mut def = fixtures::definition("app", "job");
        def.retention_days = 7;
        store.insert_definition(&def).unwrap();
        let now = Utc::now();

        let old = fixtures::finished(&def, now - Duration::days(8), false, true);
        let fresh = fixtures::finished(&def, now - Duration::days(6), false, true);
        let unreported = fixtures::finished(&def, now - Duration::days(8), true, false);
        for inst in [&old, &fresh, &unreported] {
            store.insert_instance(inst).unwrap();
        }

        assert_eq!(prune_expired(&store, now).unwrap(), 1);
        assert!(store.get_instance(&old.id).unwrap().is_none());
        assert!(store.get_instance(&fresh.id).unwrap().is_some());
        assert!(store.get_instance(&unreported.id).unwrap().is_some());
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let store = SqliteStore::in_memory().unwrap();
        let mut def = fixtures::definition("app", "archive");
        def.retention_days = 0;
        store.insert_definition(&def).unwrap();
        let now = Utc::now();

        for n in 0..1000 {
            let inst = fixtures::finished(&def, now - Duration::days(400 + n), false, true);
            store.insert_instance(&inst).unwrap();
        }

        assert_eq!(prune_expired(&store, now).unwrap(), 0);
        assert_eq!(store.recent_instances(&def.id, 2000).unwrap().len(), 1000);
    }

    #[test]
    fn huge_retention_keeps_everything() {
        let store = SqliteStore::in_memory().unwrap();
        let mut def = fixtures::definition("app", "forever");
        def.retention_days = 200_000_000;
        store.insert_definition(&def).unwrap();
        let now = Utc::now();
        let old = fixtures::finished(&def, now - Duration::days(4000), false, true);
        store.insert_instance(&old).unwrap();

        assert_eq!(prune_expired(&store, now).unwrap(), 0);
        assert!(store.get_instance(&old.id).unwrap().is_some());
    }

    #[test]
    fn retention_is_per_definition() {
        let store = SqliteStore::in_memory().unwrap();
        let mut short = fixtures::definition("app", "short");
        short.retention_days = 1;
        let long = fixtures::definition("app", "long");
        store.insert_definition(&short).unwrap();
        store.insert_definition(&long).unwrap();
        let now = Utc::now();

        let a = fixtures::finished(&short, now - Duration::days(2), false, true);
        let b = fixtures::finished(&long, now - Duration::days(2), false, true);
        store.insert_instance(&a).unwrap();
        store.insert_instance(&b).unwrap();

        assert_eq!(prune_expired(&store, now).unwrap(), 1);
        assert!(store.get_instance(&a.id).unwrap().is_none());
        assert!(store.get_instance(&b.id).unwrap().is_some());
    }
}
