//! Background reclamation of detached values
//!
//! Asynchronous deletes unlink a key on the main thread and ship the
//! payload here; a dedicated thread drains the channel and drops the
//! values, so freeing a multi-megabyte list never stalls the event loop.
//! The reclaimer owns nothing but its queue end.

use crate::dict::Dict;
use crate::object::Value;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use tracing::debug;

enum Reclaim {
    Object(Value),
    /// A whole keyspace table, from FLUSHDB/FLUSHALL ASYNC.
    Table(Dict<Value>),
}

pub struct LazyFree {
    tx: Option<Sender<Reclaim>>,
    handle: Option<JoinHandle<()>>,
    queued: u64,
}

impl LazyFree {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Reclaim>();
        let handle = std::thread::Builder::new()
            .name("lazyfree".into())
            .spawn(move || {
                let mut freed: u64 = 0;
                while let Ok(item) = rx.recv() {
                    drop(item);
                    freed += 1;
                }
                debug!("lazyfree thread exiting after {freed} reclaims");
            })
            .expect("spawn lazyfree thread");
        Self { tx: Some(tx), handle: Some(handle), queued: 0 }
    }

    /// Hand a detached value to the reclaimer. Falls back to an inline
    /// drop if the thread is gone (shutdown path).
    pub fn free_object(&mut self, value: Value) {
        self.queued += 1;
        if let Some(tx) = &self.tx {
            if tx.send(Reclaim::Object(value)).is_ok() {
                return;
            }
        }
    }

    /// Hand a whole detached keyspace table to the reclaimer.
    pub fn free_table(&mut self, table: Dict<Value>) {
        self.queued += 1;
        if let Some(tx) = &self.tx {
            if tx.send(Reclaim::Table(table)).is_ok() {
                return;
            }
        }
    }

    /// Total objects ever queued (stats surface).
    pub fn queued_total(&self) -> u64 {
        self.queued
    }
}

impl Drop for LazyFree {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
