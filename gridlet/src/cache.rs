//! Shared object cache for already-materialized values.
//!
//! The cache runs as its own control-loop task and is reachable only through
//! its command queue. Sibling slots on one node share it without sharing
//! mutable memory, giving single-writer semantics by construction. Replies
//! are delivered one per command, strictly in command order.
//!
//! Admission is bounded by a byte budget. The eviction pass runs
//! synchronously after every admission and removes the entry with the
//! smallest (hit_count, last_hit_tick) key, one entry at a time, until the
//! budget holds or the cache is empty.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::value::RuntimeValue;

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub size_limit: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A Put declared a size that cannot be accounted (zero bytes). Fatal to
    /// the cache component; slots fall back to always-miss behavior.
    #[error("invalid size accounting for key {key}: declared {declared} bytes")]
    InvalidSize { key: String, declared: u64 },

    #[error("failed to size value for key {key}: {message}")]
    Sizing { key: String, message: String },

    /// The component is gone (quit or torn down by a fatal error).
    #[error("cache component unavailable")]
    Unavailable,
}

/// A successful lookup, carrying the metadata as refreshed by this hit.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Arc<RuntimeValue>,
    pub hit_count: u64,
    pub last_hit_tick: u64,
}

/// Counters flushed by `END_PROFILING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingReport {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub occupied_bytes: u64,
}

enum CacheCommand {
    Put {
        key: String,
        value: Arc<RuntimeValue>,
        size_hint: Option<u64>,
        reply: oneshot::Sender<Result<(), CacheError>>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<CacheHit>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<()>,
    },
    IsPresent {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    EndProfiling {
        reply: oneshot::Sender<ProfilingReport>,
    },
    Quit {
        reply: oneshot::Sender<()>,
    },
}

struct CacheEntry {
    value: Arc<RuntimeValue>,
    size_bytes: u64,
    hit_count: u64,
    last_hit_tick: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    occupied_bytes: u64,
    /// Logical clock, bumped once per completed mutating operation. Never
    /// wall-clock time.
    tick: u64,
    size_limit: u64,
    hits: u64,
    misses: u64,
    puts: u64,
    evictions: u64,
}

impl CacheState {
    fn new(size_limit: u64) -> Self {
        Self {
            entries: HashMap::new(),
            occupied_bytes: 0,
            tick: 0,
            size_limit,
            hits: 0,
            misses: 0,
            puts: 0,
            evictions: 0,
        }
    }

    fn put(
        &mut self,
        key: String,
        value: Arc<RuntimeValue>,
        size_hint: Option<u64>,
    ) -> Result<(), CacheError> {
        let size_bytes = match size_hint {
            Some(declared) => declared,
            None => sized(&key, &value)?,
        };
        if size_bytes == 0 {
            return Err(CacheError::InvalidSize {
                key,
                declared: size_bytes,
            });
        }

        // Replacement is a fresh admission: stats do not carry over.
        if let Some(old) = self.entries.remove(&key) {
            self.occupied_bytes -= old.size_bytes;
        }

        self.tick += 1;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                size_bytes,
                hit_count: 0,
                last_hit_tick: self.tick,
            },
        );
        self.occupied_bytes += size_bytes;
        self.puts += 1;

        self.evict_to_limit();
        Ok(())
    }

    fn get(&mut self, key: &str) -> Option<CacheHit> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                // A hit mutates entry metadata, so it advances the tick.
                self.tick += 1;
                entry.hit_count += 1;
                entry.last_hit_tick = self.tick;
                self.hits += 1;
                Some(CacheHit {
                    value: Arc::clone(&entry.value),
                    hit_count: entry.hit_count,
                    last_hit_tick: entry.last_hit_tick,
                })
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.occupied_bytes -= entry.size_bytes;
            self.tick += 1;
        }
    }

    fn evict_to_limit(&mut self) {
        while self.occupied_bytes > self.size_limit {
            let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(key, e)| (e.hit_count, e.last_hit_tick, *key))
                .map(|(key, _)| key.clone())
            else {
                break;
            };

            if let Some(entry) = self.entries.remove(&victim) {
                self.occupied_bytes -= entry.size_bytes;
                self.evictions += 1;
                tracing::debug!(
                    key = %victim,
                    size_bytes = entry.size_bytes,
                    hit_count = entry.hit_count,
                    "evicted cache entry"
                );
            }
        }
    }

    fn report(&self) -> ProfilingReport {
        ProfilingReport {
            hits: self.hits,
            misses: self.misses,
            puts: self.puts,
            evictions: self.evictions,
            entry_count: self.entries.len(),
            occupied_bytes: self.occupied_bytes,
        }
    }
}

fn sized(key: &str, value: &RuntimeValue) -> Result<u64, CacheError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Sizing {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    Ok(bytes.len() as u64)
}

/// Handle for talking to the cache component.
///
/// Every method blocks on the component's reply. If the component has torn
/// down, lookups report a miss and mutations report `Unavailable`; sibling
/// slots keep running without the cache.
#[derive(Clone, Debug)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: Arc<RuntimeValue>,
        size_hint: Option<u64>,
    ) -> Result<(), CacheError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCommand::Put {
                key: key.into(),
                value,
                size_hint,
                reply,
            })
            .await
            .map_err(|_| CacheError::Unavailable)?;
        rx.await.map_err(|_| CacheError::Unavailable)?
    }

    /// Lookup. `None` covers both a genuine miss and an unavailable
    /// component (the always-miss fallback).
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCommand::Get {
                key: key.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCommand::Remove {
                key: key.to_string(),
                reply,
            })
            .await
            .map_err(|_| CacheError::Unavailable)?;
        rx.await.map_err(|_| CacheError::Unavailable)
    }

    pub async fn is_present(&self, key: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(CacheCommand::IsPresent {
                key: key.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn end_profiling(&self) -> Result<ProfilingReport, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCommand::EndProfiling { reply })
            .await
            .map_err(|_| CacheError::Unavailable)?;
        rx.await.map_err(|_| CacheError::Unavailable)
    }

    /// Drain in-flight commands and stop the component.
    pub async fn quit(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CacheCommand::Quit { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct ObjectCache;

impl ObjectCache {
    /// Spawn the cache control loop. The returned handle is cheap to clone
    /// and share across slots; the join handle resolves when the component
    /// stops.
    pub fn spawn(config: CacheConfig) -> (CacheHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let join = tokio::spawn(run_cache(config, rx));
        (CacheHandle { tx }, join)
    }
}

async fn run_cache(config: CacheConfig, mut rx: mpsc::Receiver<CacheCommand>) {
    let mut state = CacheState::new(config.size_limit);
    tracing::info!(size_limit = config.size_limit, "object cache started");

    while let Some(command) = rx.recv().await {
        match command {
            CacheCommand::Put {
                key,
                value,
                size_hint,
                reply,
            } => {
                let result = state.put(key, value, size_hint);
                let fatal = result.is_err();
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "cache put failed, tearing down component");
                }
                let _ = reply.send(result);
                if fatal {
                    break;
                }
            }
            CacheCommand::Get { key, reply } => {
                let _ = reply.send(state.get(&key));
            }
            CacheCommand::Remove { key, reply } => {
                state.remove(&key);
                let _ = reply.send(());
            }
            CacheCommand::IsPresent { key, reply } => {
                let _ = reply.send(state.entries.contains_key(&key));
            }
            CacheCommand::EndProfiling { reply } => {
                let report = state.report();
                tracing::info!(
                    hits = report.hits,
                    misses = report.misses,
                    puts = report.puts,
                    evictions = report.evictions,
                    entry_count = report.entry_count,
                    occupied_bytes = report.occupied_bytes,
                    "cache profiling report"
                );
                let _ = reply.send(report);
            }
            CacheCommand::Quit { reply } => {
                tracing::info!(entry_count = state.entries.len(), "object cache stopping");
                let _ = reply.send(());
                break;
            }
        }
    }
}
