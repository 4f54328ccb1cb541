//! wgpu device management.
//!
//! A `GpuContext` owns one logical device and its queue, plus the compiled
//! pipelines for that device. Contexts are opened lazily per ordinal and
//! shared for the life of the process, so every tensor placed on `gpu:N`
//! lives on the same device.
//!
//! Only hardware adapters with compute support count as GPUs. Software
//! rasterizers are skipped unless `allow_software_adapters(true)` was
//! called, and a missing GPU is always an error, never a silent CPU run.

mod buffer;
mod kernel;
pub mod shaders;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{KilnError, Result};
use crate::tensor::Device;

pub use buffer::GpuBuffer;
pub use kernel::dispatch;
pub(crate) use kernel::KernelPipeline;

static CONTEXTS: OnceLock<Mutex<HashMap<usize, Arc<GpuContext>>>> = OnceLock::new();
static ALLOW_SOFTWARE: AtomicBool = AtomicBool::new(false);

/// Whether software (CPU-emulated) adapters may back `gpu:N`.
///
/// Only affects contexts opened after the call.
pub fn allow_software_adapters(allow: bool) {
    ALLOW_SOFTWARE.store(allow, Ordering::SeqCst);
}

pub fn software_adapters_allowed() -> bool {
    ALLOW_SOFTWARE.load(Ordering::SeqCst)
}

/// Get or open the context for `gpu:ordinal`.
pub fn context(ordinal: usize) -> Result<Arc<GpuContext>> {
    let registry = CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut contexts = registry.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(ctx) = contexts.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }
    let ctx = Arc::new(GpuContext::open(ordinal)?);
    contexts.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

// ─── Adapters ──────────────────────────────────────────────────────

/// Printable summary of an adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub driver: String,
}

impl AdapterSummary {
    fn from_info(info: &wgpu::AdapterInfo) -> Self {
        AdapterSummary {
            name: info.name.clone(),
            backend: format!("{:?}", info.backend),
            device_type: format!("{:?}", info.device_type),
            driver: if info.driver_info.is_empty() {
                info.driver.clone()
            } else {
                format!("{} {}", info.driver, info.driver_info)
            },
        }
    }
}

impl fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.backend, self.device_type)?;
        if !self.driver.is_empty() {
            write!(f, " [{}]", self.driver)?;
        }
        Ok(())
    }
}

/// An adapter as seen by `kiln devices`.
#[derive(Clone, Debug)]
pub struct AdapterEntry {
    pub summary: AdapterSummary,
    /// Ordinal when usable as `gpu:N`.
    pub ordinal: Option<usize>,
    /// Why the adapter was skipped.
    pub skipped: Option<String>,
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Why `adapter` cannot run kiln kernels, if it can't.
fn rejection(adapter: &wgpu::Adapter, allow_software: bool) -> Option<String> {
    let info = adapter.get_info();
    if info.device_type == wgpu::DeviceType::Cpu && !allow_software {
        return Some("software adapter".to_string());
    }
    let caps = adapter.get_downlevel_capabilities();
    if !caps.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        return Some("no compute shader support".to_string());
    }
    None
}

/// Preference order: discrete, integrated, virtual, other, software; then
/// native backends ahead of GL.
fn rank(info: &wgpu::AdapterInfo) -> (u8, u8) {
    let device = match info.device_type {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu => 1,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 3,
        wgpu::DeviceType::Cpu => 4,
    };
    let backend = match info.backend {
        wgpu::Backend::Vulkan | wgpu::Backend::Metal | wgpu::Backend::Dx12 => 0,
        wgpu::Backend::Gl => 1,
        _ => 2,
    };
    (device, backend)
}

/// Usable adapters in ordinal order. The same physical device exposed by
/// several backends is kept once, under its preferred backend.
fn usable_adapters(instance: &wgpu::Instance, allow_software: bool) -> Vec<wgpu::Adapter> {
    let mut adapters: Vec<wgpu::Adapter> = instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .filter(|a| rejection(a, allow_software).is_none())
        .collect();
    adapters.sort_by_key(|a| rank(&a.get_info()));

    let mut seen = Vec::new();
    adapters.retain(|a| {
        let info = a.get_info();
        let key = (info.name.clone(), info.vendor, info.device);
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
    adapters
}

/// Every adapter wgpu can see, with the ordinal it maps to.
pub fn list_adapters() -> Vec<AdapterEntry> {
    let instance = instance();
    let allow_software = software_adapters_allowed();
    let usable: Vec<wgpu::AdapterInfo> = usable_adapters(&instance, allow_software)
        .iter()
        .map(|a| a.get_info())
        .collect();

    let mut entries = Vec::new();
    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        let info = adapter.get_info();
        let ordinal = usable.iter().position(|u| {
            u.name == info.name && u.vendor == info.vendor && u.device == info.device
                && u.backend == info.backend
        });
        let skipped = match ordinal {
            Some(_) => None,
            None => Some(
                rejection(&adapter, allow_software)
                    .unwrap_or_else(|| "duplicate of a preferred backend".to_string()),
            ),
        };
        entries.push(AdapterEntry {
            summary: AdapterSummary::from_info(&info),
            ordinal,
            skipped,
        });
    }
    entries.sort_by_key(|e| e.ordinal.unwrap_or(usize::MAX));
    entries
}

// ─── Context ───────────────────────────────────────────────────────

fn record_fault(slot: &Mutex<Option<String>>, message: String) {
    let mut fault = slot.lock().unwrap_or_else(|e| e.into_inner());
    fault.get_or_insert(message);
}

pub struct GpuContext {
    ordinal: usize,
    summary: AdapterSummary,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Mutex<HashMap<String, Arc<KernelPipeline>>>,
    /// First error wgpu raised outside any error scope, or the reason the
    /// device was lost. Once set, every later operation fails with it.
    fault: Arc<Mutex<Option<String>>>,
}

impl GpuContext {
    fn open(ordinal: usize) -> Result<GpuContext> {
        let target = Device::Gpu(ordinal);
        let allow_software = software_adapters_allowed();
        let instance = instance();
        let mut adapters = usable_adapters(&instance, allow_software);

        if ordinal >= adapters.len() {
            let reason = if adapters.is_empty() {
                if allow_software {
                    "no adapter with compute support was found".to_string()
                } else {
                    "no hardware adapter with compute support was found".to_string()
                }
            } else {
                format!("only {} usable adapter(s) present", adapters.len())
            };
            return Err(KilnError::NoAdapter {
                device: target,
                reason,
            });
        }
        let adapter = adapters.swap_remove(ordinal);
        let summary = AdapterSummary::from_info(&adapter.get_info());
        tracing::info!(device = %target, adapter = %summary, "opening GPU");

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("kiln"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| KilnError::DeviceRequest {
            device: target,
            message: e.to_string(),
        })?;

        // The default handlers panic; record the fault instead.
        let fault = Arc::new(Mutex::new(None));
        let uncaptured = Arc::clone(&fault);
        device.on_uncaptured_error(Box::new(move |err: wgpu::Error| {
            tracing::error!(device = %target, error = %err, "uncaptured GPU error");
            record_fault(&uncaptured, err.to_string());
        }));
        let lost = Arc::clone(&fault);
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!(device = %target, ?reason, %message, "GPU device lost");
            record_fault(&lost, format!("device lost ({:?}): {}", reason, message));
        });

        Ok(GpuContext {
            ordinal,
            summary,
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
            fault,
        })
    }

    /// Fails if the device faulted earlier.
    pub(crate) fn check_healthy(&self) -> Result<()> {
        let fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        match fault.as_ref() {
            Some(message) => Err(self.error(message.clone())),
            None => Ok(()),
        }
    }

    /// Run `f` inside validation and out-of-memory error scopes, turning
    /// anything they catch into an error.
    pub(crate) fn scoped<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.check_healthy()?;
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(err) => Err(self.error(format!("{}: {}", what, err))),
            None => Ok(value),
        }
    }

    fn error(&self, message: String) -> KilnError {
        KilnError::Gpu {
            device: Device::Gpu(self.ordinal),
            message,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn adapter(&self) -> &AdapterSummary {
        &self.summary
    }

    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Most `f32` elements one storage buffer can hold on this device.
    pub fn max_buffer_len(&self) -> usize {
        let bytes = buffer::max_binding_bytes(&self.device.limits());
        usize::try_from(bytes / std::mem::size_of::<f32>() as u64).unwrap_or(usize::MAX)
    }

    /// Number of distinct kernels built on this device.
    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("ordinal", &self.ordinal)
            .field("adapter", &self.summary)
            .finish()
    }
}
