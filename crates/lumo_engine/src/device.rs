//! OpenCL device discovery, capability query, and kernel program builds.
//!
//! One `Gpu` is created at startup and borrowed by everything else. The
//! command queue is in-order with profiling enabled, which is what makes the
//! dispatch layer's ordering story work without explicit events.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{Context, Device, Platform, Program, Queue};

/// Canonical compiler options prepended to every program build.
pub const DEFAULT_BUILD_OPTS: &str = "-cl-std=CL3.0 -cl-mad-enable -cl-fast-relaxed-math";

/// Typical wave width on the Adreno class when the driver does not report one.
const FALLBACK_SUBGROUP_SIZE: usize = 64;

/// Frozen capability record, queried once at startup. Absent capabilities
/// read as zero / false; consumers must treat that as "not available".
#[derive(Clone, Debug, Default)]
pub struct DeviceCaps {
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    pub compute_units: u32,
    pub max_workgroup_size: usize,
    pub local_mem_size: u64,
    pub global_mem_size: u64,
    pub max_alloc_size: u64,
    pub image_support: bool,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
    pub has_fp16: bool,
    pub has_subgroups: bool,
    pub has_int_dot_product: bool,
    pub has_qcom_subgroup_shuffle: bool,
    pub has_qcom_onchip_global_memory: bool,
    pub has_qcom_recordable_queues: bool,
    pub has_qcom_perf_hint: bool,
    pub has_qcom_dot_product8: bool,
    pub has_qcom_ahb: bool,
    pub preferred_subgroup_size: usize,
}

impl DeviceCaps {
    /// Multi-line human-readable summary, for `--device-info`.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("Device            : {}\n", self.name));
        s.push_str(&format!("Vendor            : {}\n", self.vendor));
        s.push_str(&format!("Driver            : {}\n", self.driver_version));
        s.push_str(&format!("Compute units     : {}\n", self.compute_units));
        s.push_str(&format!("Max workgroup     : {}\n", self.max_workgroup_size));
        s.push_str(&format!("Local memory      : {} KB\n", self.local_mem_size / 1024));
        s.push_str(&format!("Global memory     : {} MB\n", self.global_mem_size / (1024 * 1024)));
        s.push_str(&format!("Max allocation    : {} MB\n", self.max_alloc_size / (1024 * 1024)));
        s.push_str(&format!(
            "Max image2d       : {} x {}\n",
            self.image2d_max_width, self.image2d_max_height
        ));
        s.push_str(&format!("Subgroup width    : {}\n", self.preferred_subgroup_size));
        for (ext, present) in [
            ("cl_khr_fp16", self.has_fp16),
            ("cl_khr_subgroups", self.has_subgroups),
            ("cl_khr_integer_dot_product", self.has_int_dot_product),
            ("cl_qcom_subgroup_shuffle", self.has_qcom_subgroup_shuffle),
            ("cl_qcom_onchip_global_memory", self.has_qcom_onchip_global_memory),
            ("cl_qcom_recordable_queues", self.has_qcom_recordable_queues),
            ("cl_qcom_perf_hint", self.has_qcom_perf_hint),
            ("cl_qcom_dot_product8", self.has_qcom_dot_product8),
            ("cl_qcom_android_ahardwarebuffer_host_ptr", self.has_qcom_ahb),
        ] {
            s.push_str(&format!("  {:<42} {}\n", ext, if present { "YES" } else { "no" }));
        }
        s
    }
}

/// One compute context: platform, device, context and a single in-order
/// profiled command queue.
pub struct Gpu {
    pub platform: Platform,
    pub device: Device,
    pub context: Context,
    pub queue: Queue,
    pub caps: DeviceCaps,
}

/// Exact token match against the space-separated extension string.
fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_whitespace().any(|e| e == name)
}

fn info_string(device: &Device, info: DeviceInfo) -> String {
    device.info(info).map(|r| r.to_string()).unwrap_or_default()
}

/// Prefer an Adreno/Qualcomm GPU; otherwise take the first GPU enumerated.
fn find_gpu_device() -> Result<(Platform, Device)> {
    let mut fallback: Option<(Platform, Device)> = None;

    for platform in Platform::list() {
        let devices = match Device::list(platform, Some(ocl::flags::DEVICE_TYPE_GPU)) {
            Ok(devices) => devices,
            Err(_) => continue,
        };
        for device in devices {
            let name = device.name().unwrap_or_default();
            let vendor = device.vendor().unwrap_or_default();
            let id = format!("{name} {vendor}").to_lowercase();
            if id.contains("adreno") || id.contains("qualcomm") {
                return Ok((platform, device));
            }
            if fallback.is_none() {
                fallback = Some((platform, device));
            }
        }
    }

    fallback.context("no OpenCL GPU device found")
}

impl Gpu {
    pub fn new() -> Result<Self> {
        let (platform, device) = find_gpu_device()?;

        let extensions = info_string(&device, DeviceInfo::Extensions);
        let mut caps = DeviceCaps {
            name: device.name().unwrap_or_default(),
            vendor: device.vendor().unwrap_or_default(),
            driver_version: info_string(&device, DeviceInfo::DriverVersion),
            has_fp16: has_extension(&extensions, "cl_khr_fp16"),
            has_subgroups: has_extension(&extensions, "cl_khr_subgroups"),
            has_int_dot_product: has_extension(&extensions, "cl_khr_integer_dot_product"),
            has_qcom_subgroup_shuffle: has_extension(&extensions, "cl_qcom_subgroup_shuffle"),
            has_qcom_onchip_global_memory: has_extension(&extensions, "cl_qcom_onchip_global_memory"),
            has_qcom_recordable_queues: has_extension(&extensions, "cl_qcom_recordable_queues"),
            has_qcom_perf_hint: has_extension(&extensions, "cl_qcom_perf_hint"),
            has_qcom_dot_product8: has_extension(&extensions, "cl_qcom_dot_product8"),
            has_qcom_ahb: has_extension(&extensions, "cl_qcom_android_ahardwarebuffer_host_ptr"),
            ..DeviceCaps::default()
        };

        if let Ok(DeviceInfoResult::MaxComputeUnits(n)) = device.info(DeviceInfo::MaxComputeUnits) {
            caps.compute_units = n;
        }
        if let Ok(DeviceInfoResult::MaxWorkGroupSize(n)) = device.info(DeviceInfo::MaxWorkGroupSize) {
            caps.max_workgroup_size = n;
        }
        if let Ok(DeviceInfoResult::LocalMemSize(n)) = device.info(DeviceInfo::LocalMemSize) {
            caps.local_mem_size = n;
        }
        if let Ok(DeviceInfoResult::GlobalMemSize(n)) = device.info(DeviceInfo::GlobalMemSize) {
            caps.global_mem_size = n;
        }
        if let Ok(DeviceInfoResult::MaxMemAllocSize(n)) = device.info(DeviceInfo::MaxMemAllocSize) {
            caps.max_alloc_size = n;
        }
        if let Ok(DeviceInfoResult::ImageSupport(b)) = device.info(DeviceInfo::ImageSupport) {
            caps.image_support = b;
        }
        if let Ok(DeviceInfoResult::Image2dMaxWidth(n)) = device.info(DeviceInfo::Image2dMaxWidth) {
            caps.image2d_max_width = n;
        }
        if let Ok(DeviceInfoResult::Image2dMaxHeight(n)) = device.info(DeviceInfo::Image2dMaxHeight) {
            caps.image2d_max_height = n;
        }

        // The binding exposes no portable subgroup-size query; when the
        // device advertises subgroups at all, assume the usual wave width.
        caps.preferred_subgroup_size = if caps.has_subgroups { FALLBACK_SUBGROUP_SIZE } else { 0 };

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .context("OpenCL context creation failed")?;

        let queue = Queue::new(&context, device, Some(ocl::flags::QUEUE_PROFILING_ENABLE))
            .context("command queue creation failed")?;

        tracing::info!(device = %caps.name, vendor = %caps.vendor, "initialized OpenCL device");

        Ok(Self { platform, device, context, queue, caps })
    }

    /// Compile a program from source with the canonical option set plus any
    /// extra options. The driver's build log travels with the error.
    pub fn build_program(&self, source: &str, extra_opts: &str) -> Result<Program> {
        let mut builder = Program::builder();
        builder.devices(self.device).src(source).cmplr_opt(DEFAULT_BUILD_OPTS);
        if !extra_opts.is_empty() {
            builder.cmplr_opt(extra_opts);
        }
        builder
            .build(&self.context)
            .map_err(|e| anyhow!("kernel program build failed:\n{e}"))
    }

    /// Read a `.cl` source file and forward to [`Gpu::build_program`].
    pub fn build_program_from_file<P: AsRef<Path>>(&self, path: P, extra_opts: &str) -> Result<Program> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).with_context(|| format!("cannot read kernel file {path:?}"))?;
        self.build_program(&source, extra_opts)
            .with_context(|| format!("failed to build {path:?}"))
    }

    /// Drain the queue; the only blocking point apart from profiled waits
    /// and blocking reads.
    pub fn finish(&self) -> Result<()> {
        self.queue.finish()?;
        Ok(())
    }
}
