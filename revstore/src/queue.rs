//! Serialized execution of all storage access on a dedicated thread.
//!
//! The [`Connection`] is owned by a worker thread. Units of work are sent to it over a bounded
//! channel and run strictly one after another, in submission order. Results travel back over a
//! oneshot channel per unit.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use tokio::sync::oneshot;
use tracing::{debug, error, error_span, trace, warn};

use crate::{
    config::StoreConfig,
    error::{Error, Result},
    store::{Connection, MigrateOutcome},
};

type Unit = Box<dyn FnOnce(&mut Connection) -> UnitOutcome + Send + 'static>;

#[derive(Debug, Clone, Copy)]
struct UnitOutcome {
    fatal: bool,
    delivered: bool,
}

#[derive(derive_more::Debug, derive_more::Display)]
enum Action {
    #[display("Run(transactional={transactional})")]
    Run {
        #[debug("unit")]
        unit: Unit,
        transactional: bool,
    },
    #[display("Shutdown")]
    Shutdown {
        #[debug("reply")]
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Handle to the execution queue.
///
/// Cloning the handle is cheap. When the last clone is dropped, the worker finishes the queued
/// work and exits.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: flume::Sender<Action>,
    accepting: Arc<AtomicBool>,
    join_handle: Arc<Option<JoinHandle<()>>>,
}

impl QueueHandle {
    /// Spawn the worker thread owning `conn`.
    pub fn spawn(conn: Connection, config: &StoreConfig) -> QueueHandle {
        let (action_tx, action_rx) = flume::bounded(config.queue_capacity.max(1));
        let accepting = Arc::new(AtomicBool::new(true));
        let actor = Actor {
            conn,
            action_rx,
            accepting: accepting.clone(),
        };
        let name = config.thread_name.clone();
        let join_handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let span = error_span!("revstore", %name);
                let _enter = span.enter();

                if let Err(err) = actor.run() {
                    error!("Execution queue closed with error: {err:?}");
                }
            })
            .expect("failed to spawn thread");
        let join_handle = Arc::new(Some(join_handle));
        QueueHandle {
            tx: action_tx,
            accepting,
            join_handle,
        }
    }

    /// Run a unit of work outside of an explicit transaction.
    ///
    /// Each statement the unit issues commits on its own, unless the unit opens a transaction
    /// with [`Connection::transaction`].
    pub async fn submit<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.run(f, false).await
    }

    /// Run a unit of work inside a transaction.
    ///
    /// The transaction commits if the unit returns `Ok` and rolls back otherwise.
    pub async fn submit_transactional<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.run(f, true).await
    }

    /// Migrate the schema to `target` if it is at a lower version.
    ///
    /// See [`Connection::migrate_schema`]. Returns whether the migration ran.
    pub async fn migrate_schema<F>(&self, migration: F, target: u64) -> Result<bool>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<MigrateOutcome> + Send + 'static,
    {
        self.submit(move |conn| conn.migrate_schema(migration, target))
            .await
    }

    /// Stop accepting work, finish the queued work and release the connection.
    ///
    /// Work submitted after this call fails with [`Error::QueueClosed`].
    pub async fn shutdown(&self) -> Result<()> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            warn!("execution queue is already shut down");
        }
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send_async(Action::Shutdown { reply: Some(reply) })
            .await
            .is_err()
        {
            // the worker is gone already
            return Ok(());
        }
        rx.await.ok();
        Ok(())
    }

    /// Whether the queue stopped accepting work.
    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    async fn run<T, F>(&self, f: F, transactional: bool) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::QueueClosed);
        }
        let (reply, rx) = oneshot::channel();
        let unit: Unit = Box::new(move |conn: &mut Connection| {
            let res = if transactional {
                conn.transaction(f)
            } else {
                f(conn)
            };
            let fatal = matches!(&res, Err(err) if err.is_fatal());
            let delivered = reply.send(res).is_ok();
            UnitOutcome { fatal, delivered }
        });
        self.send(Action::Run {
            unit,
            transactional,
        })
        .await?;
        // a dropped reply means the worker exited before running the unit
        rx.await.map_err(|_| Error::QueueClosed)?
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .map_err(|_| Error::QueueClosed)
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        // this means we're dropping the last reference
        if let Some(handle) = Arc::get_mut(&mut self.join_handle) {
            self.tx.send(Action::Shutdown { reply: None }).ok();
            let handle = handle.take().expect("this can only run once");
            if let Err(err) = handle.join() {
                warn!(?err, "Failed to join execution queue");
            }
        }
    }
}

struct Actor {
    conn: Connection,
    action_rx: flume::Receiver<Action>,
    accepting: Arc<AtomicBool>,
}

impl Actor {
    fn run(self) -> anyhow::Result<()> {
        let Actor {
            mut conn,
            action_rx,
            accepting,
        } = self;
        let mut shutdown_reply = None;
        let mut last_handle_dropped = false;
        let mut fatal = false;
        while let Ok(action) = action_rx.recv() {
            trace!(%action, "tick");
            match action {
                Action::Shutdown { reply } => {
                    last_handle_dropped = reply.is_none();
                    shutdown_reply = reply;
                    break;
                }
                Action::Run { unit, .. } => {
                    let outcome = unit(&mut conn);
                    if !outcome.delivered {
                        warn!("failed to send reply: receiver dropped");
                    }
                    if outcome.fatal {
                        error!("storage connection is unusable, closing the queue");
                        fatal = true;
                        break;
                    }
                }
            }
        }
        accepting.store(false, Ordering::SeqCst);
        drop(conn);
        debug!("shutdown");
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
        if !last_handle_dropped {
            // closed: turn away whatever still arrives until the last handle is gone
            while let Ok(action) = action_rx.recv() {
                match action {
                    Action::Shutdown { reply: Some(reply) } => {
                        reply.send(()).ok();
                    }
                    Action::Shutdown { reply: None } => break,
                    Action::Run { .. } => trace!("dropping unit of work: queue is closed"),
                }
            }
        }
        if fatal {
            anyhow::bail!("storage connection is unusable");
        }
        Ok(())
    }
}
