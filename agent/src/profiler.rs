//! CPU profiler facade
//!
//! Ties the profile collection, the generator and the events processor
//! together behind the start/stop surface exposed to embedders.

use aperture_shared::types::events::{CodeEvent, TickSample};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::collector::generator::ProfileGenerator;
use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use crate::processor::{ProcessorEvent, ProcessorHandle, ProcessorStats};
use crate::profile::collection::{CpuProfilesCollection, StartProfilingStatus};
use crate::profile::CpuProfile;

pub struct CpuProfiler {
    config: ProfilerConfig,
    profiles: Arc<CpuProfilesCollection>,
    generator: Arc<ProfileGenerator>,
    /// Running while at least one session is active. The lock also
    /// serializes session start against the last stop.
    processor: Mutex<Option<ProcessorHandle>>,
}

impl CpuProfiler {
    pub fn new(config: ProfilerConfig) -> Result<Self> {
        config.validate()?;
        let profiles = Arc::new(CpuProfilesCollection::new(config.max_simultaneous_profiles));
        let generator = Arc::new(ProfileGenerator::new(
            profiles.clone(),
            config.attribute_vm_state,
        ));
        Ok(Self {
            config,
            profiles,
            generator,
            processor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn generator(&self) -> &Arc<ProfileGenerator> {
        &self.generator
    }

    fn processor(&self) -> MutexGuard<'_, Option<ProcessorHandle>> {
        self.processor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_profiling(&self) -> bool {
        self.processor().is_some()
    }

    /// Queue a barrier behind everything reported so far and wait for it.
    /// A processor that died is dropped so the next start replaces it.
    async fn flush_processor(&self) -> Result<()> {
        let barrier = self.processor().as_ref().map(ProcessorHandle::flush_barrier);
        let Some(barrier) = barrier else {
            return Ok(());
        };
        match barrier.await {
            Ok(()) => Ok(()),
            Err(e) => {
                let dead = self.processor().take();
                if let Some(dead) = dead {
                    warn!("Events processor is gone, discarding it");
                    if let Err(join) = dead.stop().await {
                        warn!("Events processor failed: {}", join);
                    }
                }
                Err(e)
            }
        }
    }

    /// Start a session. Samples reported before the call are applied
    /// before the session exists, so none of them end up in it. The events
    /// processor is started with the first active session and needs a
    /// tokio runtime.
    pub async fn start_profiling(
        &self,
        title: &str,
        record_samples: bool,
    ) -> Result<StartProfilingStatus> {
        if let Err(e) = self.flush_processor().await {
            debug!("Starting '{}' with a fresh events processor: {}", title, e);
        }

        let mut processor = self.processor();
        let runtime = match processor.as_ref() {
            Some(_) => None,
            None => Some(Handle::try_current().map_err(|_| ProfilerError::NoRuntime)?),
        };

        let status = self.profiles.start_profiling(title, record_samples);
        if let (StartProfilingStatus::Started, Some(runtime)) = (status, runtime) {
            *processor = Some(ProcessorHandle::spawn(
                &runtime,
                self.generator.clone(),
                self.config.processor_queue_warn,
            ));
        }
        Ok(status)
    }

    /// Stop a session. Every sample reported before the call is applied
    /// first, so the returned profile holds exactly the samples reported
    /// while it ran. Stopping the last active session also stops the
    /// events processor.
    ///
    /// If the processor failed, the session is still stopped and kept
    /// among the finished profiles, and the failure is returned.
    pub async fn stop_profiling(&self, title: &str) -> Result<Option<Arc<CpuProfile>>> {
        let flushed = self.flush_processor().await;

        let (profile, draining) = {
            let mut processor = self.processor();
            let profile = self.profiles.stop_profiling(title);
            let draining = if self.profiles.current_count() == 0 {
                processor.take()
            } else {
                None
            };
            (profile, draining)
        };
        if let Some(handle) = draining {
            let stats = handle.stop().await?;
            debug!("Events processor idle after stopping '{}' ({} ticks)", title, stats.ticks);
        }
        flushed?;
        Ok(profile)
    }

    /// Report a code lifecycle event. While profiling it is queued behind
    /// earlier samples; otherwise it is applied right away.
    pub fn code_event(&self, event: CodeEvent) -> Result<()> {
        let processor = self.processor();
        match processor.as_ref() {
            Some(handle) => handle.enqueue(ProcessorEvent::Code(event)),
            None => {
                self.generator.process_code_event(&event);
                Ok(())
            }
        }
    }

    /// Queue a tick sample. Samples taken while no session is active are
    /// dropped.
    pub fn record_tick(&self, sample: TickSample) -> Result<()> {
        match self.processor().as_ref() {
            Some(handle) => handle.enqueue(ProcessorEvent::Tick(sample)),
            None => Ok(()),
        }
    }

    /// Number of finished profiles
    pub fn profiles_count(&self) -> usize {
        self.profiles.finished_count()
    }

    /// Finished profile by position, oldest first
    pub fn profile(&self, index: usize) -> Option<Arc<CpuProfile>> {
        self.profiles.finished_profiles().get(index).cloned()
    }

    pub fn profiles(&self) -> &Arc<CpuProfilesCollection> {
        &self.profiles
    }

    /// Forget a finished profile.
    ///
    /// # Panics
    ///
    /// Panics if the profile is not one of this profiler's finished
    /// profiles.
    pub fn delete_profile(&self, profile: &Arc<CpuProfile>) {
        self.profiles.remove_profile(profile);
    }

    /// Stop the events processor and drop every active and finished
    /// session.
    pub async fn delete_all_profiles(&self) -> Result<Option<ProcessorStats>> {
        let draining = self.processor().take();
        let stats = match draining {
            Some(handle) => Some(handle.stop().await?),
            None => None,
        };
        self.profiles.clear();
        info!("Deleted all profiles");
        Ok(stats)
    }

    /// Text listing of the current code map.
    pub fn code_map_dump(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.generator.code_map().dump(&mut out);
        out
    }
}
