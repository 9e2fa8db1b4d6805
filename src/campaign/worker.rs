use std::sync::Arc;
use std::thread::{spawn, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::backend::InjectorBackend;
use super::counter::{CancelToken, IterationCounter};
use super::results::IterationResult;
use super::Campaign;
use crate::error::Result;
use crate::targets::selector::Selector;
use crate::targets::Catalog;

/// Restriction of the injection targets, shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Target names, all targets of the catalog if `None`.
    pub targets: Option<Vec<String>>,
    /// Instance indices of multi instance targets.
    pub indices: Option<Vec<usize>>,
}

impl Selection {
    fn selector<'a>(&self, catalog: &'a Catalog, seed: u64) -> Result<Selector<'a, StdRng>> {
        Ok(Selector::new(catalog, StdRng::seed_from_u64(seed))
            .with_targets(self.targets.clone())?
            .with_indices(self.indices.clone()))
    }
}

/// Runs one campaign per thread until the iteration counter is exhausted.
///
/// Each thread claims iteration numbers from the shared [`IterationCounter`]
/// and reports every finished iteration on the results channel. The channel
/// closes once all workers are done.
///
/// # Lifecycle
///
/// 1. `start()` spawns one thread per campaign
/// 2. The coordinator drains `results()` and writes the result log
/// 3. Dropping the pool joins all worker threads
pub struct WorkerPool {
    results: Receiver<IterationResult>,
    handles: Option<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns one worker thread per campaign.
    ///
    /// # Arguments
    ///
    /// * `campaigns` - One campaign per DUT, each owning its backend and consoles.
    /// * `catalog` - Catalog the injections are chosen from.
    /// * `selection` - Target restriction applied by every worker.
    /// * `counter` - Iterations left, shared by all workers.
    /// * `cancel` - Operator interrupt flag.
    /// * `seed` - Seed of the random choices, worker `n` uses `seed + n`.
    ///
    /// # Returns
    ///
    /// * `Ok(WorkerPool)` - Workers are running.
    /// * `Err(Error)` - No campaigns were given or the selection is invalid.
    pub fn start<B: InjectorBackend + 'static>(
        campaigns: Vec<Campaign<B>>,
        catalog: Arc<Catalog>,
        selection: Selection,
        counter: IterationCounter,
        cancel: CancelToken,
        seed: u64,
    ) -> Result<Self> {
        if campaigns.is_empty() {
            return Err(crate::error::Error::Config(
                "Number of workers must be greater than 0".to_string(),
            ));
        }
        // Reject an invalid selection before any thread touches a DUT.
        selection.selector(&catalog, seed)?;

        let (sender, results): (Sender<IterationResult>, Receiver<IterationResult>) = unbounded();
        let mut handles = Vec::with_capacity(campaigns.len());
        for mut campaign in campaigns {
            let sender = sender.clone();
            let catalog = Arc::clone(&catalog);
            let selection = selection.clone();
            let counter = counter.clone();
            let cancel = cancel.clone();
            let worker_seed = seed.wrapping_add(campaign.id() as u64);
            let handle = spawn(move || {
                let mut selector = match selection.selector(&catalog, worker_seed) {
                    Ok(selector) => selector,
                    Err(e) => {
                        error!("Worker {}: {}", campaign.id(), e);
                        return;
                    }
                };
                while !cancel.is_cancelled() {
                    let Some(iteration) = counter.take() else {
                        break;
                    };
                    let result = campaign.run_iteration(iteration, &mut selector, &cancel);
                    if sender.send(result).is_err() {
                        break;
                    }
                }
                campaign.close();
                info!("Worker {} finished", campaign.id());
            });
            handles.push(handle);
        }

        Ok(Self {
            results,
            handles: Some(handles),
        })
    }

    /// Channel of finished iterations, closed when all workers are done.
    pub fn results(&self) -> &Receiver<IterationResult> {
        &self.results
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.handles.take().into_iter().flatten() {
            if let Err(e) = handle.join() {
                eprintln!("A thread panicked: {:?}", e);
            }
        }
    }
}
