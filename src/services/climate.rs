//! Foreground entry point: the context object the presentation layer holds.
//!
//! Every operation here hands work to the scheduler's worker and returns a
//! `TaskHandle`. Reads go through `snapshot`, which may be stale as soon as
//! work is submitted.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::models::mnet::{DeviceId, Preset, PresetId};
use crate::registry::{self, Registry, SharedRegistry};
use crate::services::devices::{AdjustOutcome, AdjustSummary, DeviceService, PollSummary};
use crate::services::scheduler::{Callbacks, Scheduler, SchedulerError, TaskError, TaskHandle};

pub struct ClimateService {
    scheduler: Scheduler,
    registry: SharedRegistry,
    poll_period_secs: AtomicU64,
}

impl ClimateService {
    pub fn start(service: DeviceService, poll_period: Duration) -> Result<Self, String> {
        let registry = service.registry().clone();
        let scheduler = Scheduler::start(service)?;
        Ok(ClimateService {
            scheduler,
            registry,
            poll_period_secs: AtomicU64::new(poll_period.as_secs()),
        })
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Copy of the current devices and presets.
    pub fn snapshot(&self) -> Registry {
        registry::lock(&self.registry).clone()
    }

    /// Polls every device once and runs a matching pass.
    pub fn poll_all(&self) -> Result<TaskHandle<PollSummary>, SchedulerError> {
        self.scheduler.submit(|service| Ok(service.update()))
    }

    pub fn adjust(&self, device: &DeviceId, preset: &Preset) -> Result<TaskHandle<AdjustOutcome>, SchedulerError> {
        debug!("Toggling preset {} for device {}", preset.id.0, device.0);
        let (device, preset) = (device.clone(), preset.clone());
        self.scheduler
            .submit(move |service| service.adjust(&device, &preset).map_err(TaskError::from))
    }

    pub fn adjust_all(&self, preset: &Preset) -> Result<TaskHandle<AdjustSummary>, SchedulerError> {
        debug!("Toggling preset {} for all selected devices", preset.id.0);
        let preset = preset.clone();
        self.scheduler.submit(move |service| Ok(service.adjust_all(&preset)))
    }

    /// Applies a configured preset to all selected devices. `None` for an unknown id.
    pub fn apply_preset(&self, id: &PresetId) -> Option<Result<TaskHandle<AdjustSummary>, SchedulerError>> {
        let preset = registry::lock(&self.registry).preset(id).cloned()?;
        Some(self.adjust_all(&preset))
    }

    /// Flips a device's selection and restarts the recurring poll so the change shows at once.
    pub fn toggle_device(&self, id: &DeviceId) -> Option<Result<bool, SchedulerError>> {
        let selected = {
            let mut registry = registry::lock(&self.registry);
            let device = registry.device_mut(id)?;
            device.selected = !device.selected;
            device.selected
        };
        debug!("Toggled device {} to selected={}", id.0, selected);
        let period = Duration::from_secs(self.poll_period_secs.load(Ordering::SeqCst));
        Some(self.scheduler.schedule_recurring_poll(period).map(|_| selected))
    }

    pub fn schedule_recurring_poll(&self, period_secs: u64) -> Result<Duration, SchedulerError> {
        self.poll_period_secs.store(period_secs, Ordering::SeqCst);
        self.scheduler.schedule_recurring_poll(Duration::from_secs(period_secs))
    }

    pub fn cancel_recurring_poll(&self) -> Result<(), SchedulerError> {
        self.scheduler.cancel_recurring_poll()
    }

    pub fn submit_ad_hoc<T, F>(&self, task: F, callbacks: Callbacks<T>) -> Result<TaskHandle<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceService) -> Result<T, TaskError> + Send + 'static,
    {
        self.scheduler.submit_with(task, callbacks)
    }

    pub fn shutdown(&mut self) -> bool {
        self.scheduler.shutdown()
    }

    /// Blocks until the worker stops.
    pub fn join(&mut self) {
        self.scheduler.join();
    }
}
