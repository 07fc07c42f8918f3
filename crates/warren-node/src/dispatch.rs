//! Target resolution and fan-out/fan-in dispatch.
//!
//! Bulk operations take an operator target expression (`web0`, `3`,
//! `kn[1-20]`, `all`), resolve it against the registry, and apply an
//! operation to every match. This module is the single place the
//! partial-failure semantics live: per-instance errors are collected and
//! returned as a batch, unmatched targets are logged, and single-target
//! invocations get enriched not-found/state diagnostics.

use crate::error::Error;
use crate::registry::Registry;
use crate::teardown::KillBatch;
use crate::vm::{Vm, VmState};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Reserved target token matching every instance.
pub const WILDCARD: &str = "all";

impl Registry {
    /// Resolve `target` and apply `op` to every matched instance.
    ///
    /// `op` receives the instance and whether the invocation was
    /// wildcard, and reports whether the operation was applicable in the
    /// instance's state plus any error. With `concurrent` set, matches
    /// run as independent tasks joined before returning; otherwise they
    /// run strictly sequentially in scan order (which is unspecified),
    /// letting state-mutating operations skip their own locking.
    ///
    /// Returned errors arrive in completion order for the concurrent
    /// path and are not stable across runs.
    pub async fn apply_targets<F, Fut>(&self, target: &str, concurrent: bool, op: F) -> Vec<Error>
    where
        F: Fn(Arc<dyn Vm>, bool) -> Fut,
        Fut: Future<Output = (bool, Result<(), Error>)> + Send + 'static,
    {
        let vals = match warren_ranges::split_list(target) {
            Ok(vals) => vals,
            Err(err) => return vec![Error::Parse(err)],
        };

        // Candidate names and ids still waiting for a match. A token is
        // an id iff it is fully numeric.
        let mut names: HashSet<String> = HashSet::new();
        let mut ids: HashSet<u32> = HashSet::new();
        for val in &vals {
            match val.parse::<u32>() {
                Ok(id) => ids.insert(id),
                Err(_) => names.insert(val.clone()),
            };
        }
        let wild = names.remove(WILDCARD);

        let mut matched = Vec::new();
        for vm in self.snapshot().await {
            if wild || names.contains(vm.name()) || ids.contains(&vm.id()) {
                names.remove(vm.name());
                ids.remove(&vm.id());
                matched.push(vm);
            }
        }

        // Applicability per target, keyed under both the name and the id
        // text so the single-target diagnostic below resolves whichever
        // form the operator used.
        let mut results: HashMap<String, bool> = HashMap::new();
        let mut errs = Vec::new();

        if concurrent {
            let mut tasks = JoinSet::new();
            for vm in matched {
                let fut = op(Arc::clone(&vm), wild);
                tasks.spawn(async move {
                    let (applicable, res) = fut.await;
                    (vm, applicable, res)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((vm, applicable, res)) => {
                        record(&mut results, vm.as_ref(), applicable);
                        if let Err(err) = res {
                            errs.push(err);
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "dispatch task panicked");
                    }
                }
            }
        } else {
            for vm in matched {
                let (applicable, res) = op(Arc::clone(&vm), wild).await;
                record(&mut results, vm.as_ref(), applicable);
                if let Err(err) = res {
                    errs.push(err);
                }
            }
        }

        // Special cases: a single explicit target that was never found,
        // or was found but inapplicable. Mutually exclusive, and only
        // for the single-target, non-wildcard form.
        if vals.len() == 1 && !wild {
            if names.len() + ids.len() == 1 {
                errs.push(Error::NotFound(vals[0].clone()));
            } else if !results.get(&vals[0]).copied().unwrap_or(false) {
                errs.push(Error::State(vals[0].clone()));
            }
        }

        // Unmatched leftovers are diagnostics, not errors.
        if !names.is_empty() || !ids.is_empty() {
            let mut missing: Vec<String> = names.into_iter().collect();
            missing.extend(ids.into_iter().map(|id| id.to_string()));
            tracing::info!(targets = ?missing, "VMs not found");
        }

        errs
    }

    /// Start every instance matched by `target`.
    ///
    /// Wildcard invocations only start instances that are building or
    /// paused, silently skipping the rest; an explicit target is started
    /// unless already running, so starting a terminal instance surfaces
    /// a state error.
    pub async fn start(&self, target: &str) -> Vec<Error> {
        self.apply_targets(target, true, |vm, wild| async move {
            let state = vm.state();
            let eligible = if wild {
                matches!(state, VmState::Building | VmState::Paused)
            } else {
                state != VmState::Running
            };

            if eligible {
                (true, vm.start().await)
            } else {
                (false, Ok(()))
            }
        })
        .await
    }

    /// Stop every running instance matched by `target`.
    pub async fn stop(&self, target: &str) -> Vec<Error> {
        self.apply_targets(target, true, |vm, _wild| async move {
            if vm.state() == VmState::Running {
                (true, vm.stop().await)
            } else {
                (false, Ok(()))
            }
        })
        .await
    }

    /// Kill every non-terminal instance matched by `target`, then wait
    /// for teardown acknowledgments.
    ///
    /// Dispatch is fire-and-forget per instance; this method then blocks
    /// on the per-invocation acknowledgment channel until every initiated
    /// teardown acks or the node's kill timeout elapses. Stragglers are
    /// logged, not returned as errors: the dispatch already reported any
    /// synchronous failures.
    pub async fn kill(&self, target: &str) -> Vec<Error> {
        let batch = KillBatch::new();
        let ack = batch.ack_sender();
        let pending = Arc::new(Mutex::new(HashSet::new()));

        let errs = {
            let pending = Arc::clone(&pending);
            self.apply_targets(target, true, move |vm, _wild| {
                let ack = ack.clone();
                let pending = Arc::clone(&pending);
                async move {
                    if vm.kill(ack) {
                        pending.lock().await.insert(vm.id());
                        (true, Ok(()))
                    } else {
                        (false, Ok(()))
                    }
                }
            })
            .await
        };

        let expected = std::mem::take(&mut *pending.lock().await);
        let unacked = batch.wait(expected, self.config().kill_timeout).await;
        for id in unacked {
            tracing::error!(id, "VM failed to acknowledge kill");
        }

        errs
    }
}

fn record(results: &mut HashMap<String, bool>, vm: &dyn Vm, applicable: bool) {
    if !vm.name().is_empty() {
        results.insert(vm.name().to_string(), applicable);
    }
    results.insert(vm.id().to_string(), applicable);
}
