//! Real-time service threads.
//!
//! A `Service` wraps one unit of pipeline work on a dedicated OS thread bound
//! to a fixed-priority scheduling class. Work observes a cooperative
//! `StopFlag` at its cycle boundaries; it is never interrupted mid-cycle.
//!
//! Scheduling is applied by the new thread before any work runs, and the
//! outcome is reported back to `Service::start`. A thread that cannot be
//! placed in its scheduling class is treated as a failed spawn.

use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Scheduling class for a service thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Preemptive fixed-priority (`SCHED_FIFO`).
    Fifo,
    /// The default time-shared class. Priority is recorded but not applied.
    Normal,
}

/// How a service thread is named and scheduled.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub name: &'static str,
    pub priority: i32,
    pub policy: SchedPolicy,
    /// Pin the thread to a single CPU.
    pub cpu: Option<usize>,
}

impl ServiceSpec {
    pub fn new(name: &'static str, priority: i32, policy: SchedPolicy) -> Self {
        Self {
            name,
            priority,
            policy,
            cpu: None,
        }
    }

    pub fn with_cpu(mut self, cpu: Option<usize>) -> Self {
        self.cpu = cpu;
        self
    }
}

/// Cooperative stop signal shared between a service and its owner.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Checked by running work once per cycle.
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running service thread producing a `T` when its work returns.
#[derive(Debug)]
pub struct Service<T> {
    name: &'static str,
    stop: StopFlag,
    join: Option<JoinHandle<Result<T>>>,
}

/// Sends the service name on drop, so a panicking service still reports its exit.
struct ExitNotice {
    name: &'static str,
    tx: Option<mpsc::Sender<&'static str>>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(self.name);
        }
    }
}

impl<T: Send + 'static> Service<T> {
    /// Spawn `work` on a new thread scheduled per `spec`.
    ///
    /// When `exit_notify` is set, the service name is sent on it as soon as
    /// the work returns or panics.
    pub fn start<F>(
        spec: ServiceSpec,
        exit_notify: Option<mpsc::Sender<&'static str>>,
        work: F,
    ) -> Result<Self>
    where
        F: FnOnce(&StopFlag) -> Result<T> + Send + 'static,
    {
        let (name, priority, policy) = (spec.name, spec.priority, spec.policy);
        let stop = StopFlag::new();
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(err) = apply_scheduling(&spec) {
                    let _ = ready_tx.send(Err(err));
                    return Err(anyhow!("service {} not scheduled", spec.name));
                }
                let _ = ready_tx.send(Ok(()));
                let _notice = ExitNotice {
                    name: spec.name,
                    tx: exit_notify,
                };
                work(&thread_stop)
            })
            .with_context(|| format!("spawn service thread {}", name))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = join.join();
                return Err(err.context(format!("start service {}", name)));
            }
            Err(_) => {
                let _ = join.join();
                return Err(anyhow!("service {} exited before reporting start", name));
            }
        }

        log::debug!(
            "Service: {} started (priority {}, {:?})",
            name,
            priority,
            policy
        );
        Ok(Self {
            name,
            stop,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the work to return at its next cycle boundary.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Block until the thread returns. A panic in the work becomes an error.
    pub fn join(mut self) -> Result<T> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("service {} already joined", self.name))?;
        match join.join() {
            Ok(result) => result.with_context(|| format!("service {} failed", self.name)),
            Err(panic) => Err(anyhow!(
                "service {} panicked: {}",
                self.name,
                panic_message(panic.as_ref())
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Priority range of the fixed-priority class on this host.
#[cfg(target_os = "linux")]
pub fn fifo_priority_range() -> Result<(i32, i32)> {
    // SAFETY: plain syscalls without pointer arguments.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    if min < 0 || max < 0 {
        return Err(std::io::Error::last_os_error()).context("query SCHED_FIFO priority range");
    }
    Ok((min, max))
}

#[cfg(not(target_os = "linux"))]
pub fn fifo_priority_range() -> Result<(i32, i32)> {
    Err(anyhow!("fixed-priority scheduling requires Linux"))
}

/// Number of CPU indices an affinity set can name on this host.
#[cfg(target_os = "linux")]
pub fn max_cpus() -> usize {
    libc::CPU_SETSIZE as usize
}

#[cfg(not(target_os = "linux"))]
pub fn max_cpus() -> usize {
    usize::MAX
}

#[cfg(target_os = "linux")]
fn apply_scheduling(spec: &ServiceSpec) -> Result<()> {
    if let Some(cpu) = spec.cpu {
        if cpu >= max_cpus() {
            return Err(anyhow!(
                "cpu {} for {} is out of range (affinity sets hold {})",
                cpu,
                spec.name,
                max_cpus()
            ));
        }
        // SAFETY: cpu_set_t is plain data; the set outlives the call.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("pin {} to cpu {}", spec.name, cpu));
        }
    }

    match spec.policy {
        SchedPolicy::Normal => Ok(()),
        SchedPolicy::Fifo => {
            // SAFETY: sched_param is plain data and only read by the call.
            let rc = unsafe {
                let mut param: libc::sched_param = std::mem::zeroed();
                param.sched_priority = spec.priority;
                libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
            };
            if rc != 0 {
                return Err(std::io::Error::from_raw_os_error(rc)).with_context(|| {
                    format!(
                        "set SCHED_FIFO priority {} for {}",
                        spec.priority, spec.name
                    )
                });
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_scheduling(spec: &ServiceSpec) -> Result<()> {
    if spec.cpu.is_some() {
        return Err(anyhow!("cpu pinning requires Linux"));
    }
    match spec.policy {
        SchedPolicy::Normal => Ok(()),
        SchedPolicy::Fifo => Err(anyhow!("fixed-priority scheduling requires Linux")),
    }
}
