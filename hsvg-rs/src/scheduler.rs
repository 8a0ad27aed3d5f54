//! Learning rate schedulers.

use crate::optimizer::HsvgOptimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Multiply the learning rate by `gamma` after every epoch
    Exponential {
        /// Decay factor per step
        gamma: f64,
    },
}

/// Learning rate scheduler, stepped once per epoch.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base learning rate
    base_lr: f64,
    /// Completed steps
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_step: 0,
        }
    }

    /// Get learning rate for current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Exponential { gamma } => {
                let exponent = i32::try_from(self.current_step).unwrap_or(i32::MAX);
                self.base_lr * gamma.powi(exponent)
            }
        }
    }

    /// Completed steps.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Jump to `step` completed steps, e.g. when resuming at an epoch.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut HsvgOptimizer) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }
}
