//! Bookkeeping of port mappings shared by every parent-side driver
//!
//! The table lock is held only for lookups and inserts. Each mapping owns a
//! slot behind its own async mutex, so work on one mapping (binding,
//! tearing down) never blocks another, while calls on the same id queue up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use rootgate_core::{Error, PortId, PortSpec, PortStatus, Result};

type Slot<T> = Arc<AsyncMutex<Option<T>>>;

struct Entry<T> {
    status: PortStatus,
    active: bool,
    slot: Slot<T>,
}

struct Inner<T> {
    next_id: u64,
    entries: BTreeMap<PortId, Entry<T>>,
}

/// Port mappings keyed by id, holding one forwarding handle `T` each
pub struct PortTable<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for PortTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PortTable<T> {
    /// Empty table; the first id handed out is 1
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Claim an id for `spec`
    ///
    /// The returned guard holds the new mapping's slot: a concurrent
    /// `remove` of the same id waits until the caller fills or abandons it.
    ///
    /// # Errors
    /// Returns [`Error::PortConflict`] if another mapping, pending or
    /// active, claims the same protocol and host address
    pub fn reserve(&self, spec: PortSpec) -> Result<(PortId, OwnedMutexGuard<Option<T>>)> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .entries
            .values()
            .find(|e| spec.conflicts_with(&e.status.spec))
        {
            return Err(Error::PortConflict {
                spec: spec.to_string(),
                existing: existing.status.id.as_raw(),
            });
        }

        let id = PortId::from_raw(inner.next_id);
        inner.next_id += 1;
        let slot: Slot<T> = Arc::new(AsyncMutex::new(None));
        let guard = Arc::clone(&slot)
            .try_lock_owned()
            .map_err(|_| Error::desync("fresh port slot already locked"))?;
        inner.entries.insert(
            id,
            Entry {
                status: PortStatus { id, spec },
                active: false,
                slot,
            },
        );
        Ok((id, guard))
    }

    /// Mark a reserved mapping active, recording the spec actually bound
    pub fn activate(&self, id: PortId, spec: PortSpec) -> PortStatus {
        let mut inner = self.lock();
        let status = PortStatus { id, spec };
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.status = status.clone();
            entry.active = true;
        }
        status
    }

    /// Slot of a mapping for `remove`
    ///
    /// # Errors
    /// Returns [`Error::PortNotFound`] for an unknown id
    pub fn slot(&self, id: PortId) -> Result<Slot<T>> {
        self.lock()
            .entries
            .get(&id)
            .map(|e| Arc::clone(&e.slot))
            .ok_or(Error::PortNotFound { id: id.as_raw() })
    }

    /// Drop a mapping from the table
    pub fn forget(&self, id: PortId) {
        self.lock().entries.remove(&id);
    }

    /// Remove a mapping and hand back its forwarding handle
    ///
    /// # Errors
    /// Returns [`Error::PortNotFound`] for an unknown id, including one
    /// whose setup failed or that a concurrent call already removed
    pub async fn take(&self, id: PortId) -> Result<T> {
        let slot = self.slot(id)?;
        let handle = slot.lock().await.take();
        self.forget(id);
        handle.ok_or(Error::PortNotFound { id: id.as_raw() })
    }

    /// Active mappings ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<PortStatus> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.active)
            .map(|e| e.status.clone())
            .collect()
    }

    /// Empty the table, handing back every forwarding handle
    pub async fn take_all(&self) -> Vec<(PortId, T)> {
        let slots: Vec<(PortId, Slot<T>)> = {
            let mut inner = self.lock();
            std::mem::take(&mut inner.entries)
                .into_iter()
                .map(|(id, e)| (id, e.slot))
                .collect()
        };
        let mut handles = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            if let Some(handle) = slot.lock().await.take() {
                handles.push((id, handle));
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(s: &str) -> PortSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_ids_start_at_one() {
        let table = PortTable::<()>::new();
        let (a, _ga) = table.reserve(spec("8080:80")).unwrap();
        let (b, _gb) = table.reserve(spec("8081:80")).unwrap();
        assert_eq!(a.as_raw(), 1);
        assert_eq!(b.as_raw(), 2);
    }

    #[test]
    fn test_conflict_names_existing_id() {
        let table = PortTable::<()>::new();
        let (id, _guard) = table.reserve(spec("8080:80")).unwrap();
        match table.reserve(spec("0.0.0.0:8080:81")) {
            Err(Error::PortConflict { existing, .. }) => assert_eq!(existing, id.as_raw()),
            other => panic!("expected conflict, got {:?}", other.map(|(id, _)| id)),
        }
        // Same port, other protocol or address
        assert!(table.reserve(spec("8080:80/udp")).is_ok());
        assert!(table.reserve(spec("127.0.0.1:8080:80")).is_ok());
    }

    #[test]
    fn test_port_zero_never_conflicts() {
        let table = PortTable::<()>::new();
        let _a = table.reserve(spec("0:80")).unwrap();
        assert!(table.reserve(spec("0:80")).is_ok());
    }

    #[tokio::test]
    async fn test_pending_mappings_are_not_listed() {
        let table = PortTable::<u8>::new();
        let (id, mut guard) = table.reserve(spec("0:80")).unwrap();
        assert!(table.list().is_empty());

        *guard = Some(7);
        drop(guard);
        let status = table.activate(id, spec("40000:80"));
        assert_eq!(status.spec.host.port(), 40000);
        assert_eq!(table.list(), vec![status]);
    }

    #[tokio::test]
    async fn test_take_and_unknown_id() {
        let table = PortTable::<u8>::new();
        let (id, mut guard) = table.reserve(spec("8080:80")).unwrap();
        *guard = Some(1);
        drop(guard);
        table.activate(id, spec("8080:80"));

        assert_eq!(table.take(id).await.unwrap(), 1);
        assert!(matches!(
            table.take(id).await,
            Err(Error::PortNotFound { id: 1 })
        ));
        assert!(table.list().is_empty());
        // The address is free again
        assert!(table.reserve(spec("8080:80")).is_ok());
    }

    #[tokio::test]
    async fn test_remove_waits_for_pending_add() {
        let table = Arc::new(PortTable::<u8>::new());
        let (id, mut guard) = table.reserve(spec("8080:80")).unwrap();

        let remover = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.take(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished());

        *guard = Some(9);
        drop(guard);
        assert_eq!(remover.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_failed_add_reads_as_not_found() {
        let table = Arc::new(PortTable::<u8>::new());
        let (id, guard) = table.reserve(spec("8080:80")).unwrap();
        let remover = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.take(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.forget(id);
        drop(guard);
        assert!(matches!(
            remover.await.unwrap(),
            Err(Error::PortNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_take_all_empties_table() {
        let table = PortTable::<u8>::new();
        for (n, s) in ["8080:80", "8081:81"].into_iter().enumerate() {
            let (id, mut guard) = table.reserve(spec(s)).unwrap();
            *guard = Some(u8::try_from(n).unwrap());
            drop(guard);
            table.activate(id, spec(s));
        }
        let handles = table.take_all().await;
        assert_eq!(handles.len(), 2);
        assert!(table.list().is_empty());
    }
}
