//! A thin capability surface over NVML. Managers talk to the [`Nvml`],
//! [`Device`], [`GpuInstance`], and [`ComputeInstance`] traits; the only
//! implementation against real hardware lives in [`libnvml`], backed by the
//! dynamically loaded `libnvidia-ml.so.1`.

use std::fmt;

pub mod libnvml;

#[cfg(test)]
pub(crate) mod mock;

pub use libnvml::LibNvml;

/// MIG mode values as NVML encodes them.
pub const MIG_DISABLE: u32 = 0x0;
pub const MIG_ENABLE: u32 = 0x1;

// GPU instance profile indices.
pub const GPU_INSTANCE_PROFILE_1_SLICE: u32 = 0x0;
pub const GPU_INSTANCE_PROFILE_2_SLICE: u32 = 0x1;
pub const GPU_INSTANCE_PROFILE_3_SLICE: u32 = 0x2;
pub const GPU_INSTANCE_PROFILE_4_SLICE: u32 = 0x3;
pub const GPU_INSTANCE_PROFILE_7_SLICE: u32 = 0x4;
pub const GPU_INSTANCE_PROFILE_8_SLICE: u32 = 0x5;
pub const GPU_INSTANCE_PROFILE_6_SLICE: u32 = 0x6;
pub const GPU_INSTANCE_PROFILE_1_SLICE_REV1: u32 = 0x7;
pub const GPU_INSTANCE_PROFILE_2_SLICE_REV1: u32 = 0x8;
pub const GPU_INSTANCE_PROFILE_1_SLICE_REV2: u32 = 0x9;
pub const GPU_INSTANCE_PROFILE_COUNT: u32 = 0xA;

// Compute instance profile indices.
pub const COMPUTE_INSTANCE_PROFILE_1_SLICE: u32 = 0x0;
pub const COMPUTE_INSTANCE_PROFILE_2_SLICE: u32 = 0x1;
pub const COMPUTE_INSTANCE_PROFILE_3_SLICE: u32 = 0x2;
pub const COMPUTE_INSTANCE_PROFILE_4_SLICE: u32 = 0x3;
pub const COMPUTE_INSTANCE_PROFILE_7_SLICE: u32 = 0x4;
pub const COMPUTE_INSTANCE_PROFILE_8_SLICE: u32 = 0x5;
pub const COMPUTE_INSTANCE_PROFILE_6_SLICE: u32 = 0x6;
pub const COMPUTE_INSTANCE_PROFILE_1_SLICE_REV1: u32 = 0x7;
pub const COMPUTE_INSTANCE_PROFILE_COUNT: u32 = 0x8;

// Compute instance engine profile indices.
pub const COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED: u32 = 0x0;
pub const COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT: u32 = 0x1;

/// NVML return codes surfaced to callers. Only the codes the managers
/// branch on get their own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Uninitialized,
    InvalidArgument,
    NotSupported,
    NoPermission,
    NotFound,
    InsufficientSize,
    DriverNotLoaded,
    Timeout,
    LibraryNotFound,
    FunctionNotFound,
    InUse,
    InsufficientResources,
    Unknown(u32),
}

impl Error {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Uninitialized,
            2 => Self::InvalidArgument,
            3 => Self::NotSupported,
            4 => Self::NoPermission,
            6 => Self::NotFound,
            7 => Self::InsufficientSize,
            9 => Self::DriverNotLoaded,
            10 => Self::Timeout,
            12 => Self::LibraryNotFound,
            13 => Self::FunctionNotFound,
            19 => Self::InUse,
            23 => Self::InsufficientResources,
            code => Self::Unknown(code),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "NVML not initialized"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NoPermission => write!(f, "insufficient permissions"),
            Self::NotFound => write!(f, "object not found"),
            Self::InsufficientSize => write!(f, "insufficient buffer size"),
            Self::DriverNotLoaded => write!(f, "NVIDIA driver not loaded"),
            Self::Timeout => write!(f, "timeout"),
            Self::LibraryNotFound => write!(f, "NVML library not found"),
            Self::FunctionNotFound => write!(f, "NVML function not found"),
            Self::InUse => write!(f, "resource in use"),
            Self::InsufficientResources => write!(f, "insufficient resources"),
            Self::Unknown(code) => write!(f, "NVML error code {}", code),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where a GPU instance sits on the device, in memory-slice units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuInstancePlacement {
    pub start: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuInstanceProfileInfo {
    pub id: u32,
    pub slice_count: u32,
    pub instance_count: u32,
    pub multiprocessor_count: u32,
    pub memory_size_mb: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputeInstanceProfileInfo {
    pub id: u32,
    pub slice_count: u32,
    pub instance_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuInstanceInfo {
    pub id: u32,
    pub profile_id: u32,
    pub placement: GpuInstancePlacement,
}

#[derive(Debug, Clone, Copy)]
pub struct ComputeInstanceInfo {
    pub id: u32,
    pub profile_id: u32,
}

/// The process-wide NVML capability. Callers bracket every top-level
/// operation with `init`/`shutdown`, most conveniently via [`InitGuard`].
pub trait Nvml {
    fn init(&self) -> Result<()>;
    fn shutdown(&self) -> Result<()>;
    fn device_count(&self) -> Result<u32>;
    fn device_by_index(&self, index: u32) -> Result<Box<dyn Device>>;
}

pub trait Device {
    fn index(&self) -> Result<u32>;
    fn uuid(&self) -> Result<String>;
    fn name(&self) -> Result<String>;
    fn pci_device_id(&self) -> Result<u32>;
    fn pci_bus_id(&self) -> Result<String>;

    /// Returns `(current, pending)` mode values.
    fn mig_mode(&self) -> Result<(u32, u32)>;
    fn set_mig_mode(&self, mode: u32) -> Result<()>;

    fn gpu_instance_profile_info(&self, profile: u32) -> Result<GpuInstanceProfileInfo>;
    fn gpu_instances(&self, info: &GpuInstanceProfileInfo) -> Result<Vec<Box<dyn GpuInstance>>>;
    fn create_gpu_instance(&self, info: &GpuInstanceProfileInfo) -> Result<Box<dyn GpuInstance>>;
    fn create_gpu_instance_with_placement(
        &self,
        info: &GpuInstanceProfileInfo,
        placement: &GpuInstancePlacement,
    ) -> Result<Box<dyn GpuInstance>>;
}

pub trait GpuInstance: std::fmt::Debug {
    fn info(&self) -> Result<GpuInstanceInfo>;
    fn compute_instance_profile_info(
        &self,
        profile: u32,
        eng_profile: u32,
    ) -> Result<ComputeInstanceProfileInfo>;
    fn compute_instances(
        &self,
        info: &ComputeInstanceProfileInfo,
    ) -> Result<Vec<Box<dyn ComputeInstance>>>;
    fn create_compute_instance(
        &self,
        info: &ComputeInstanceProfileInfo,
    ) -> Result<Box<dyn ComputeInstance>>;
    fn destroy(&self) -> Result<()>;
}

pub trait ComputeInstance {
    fn info(&self) -> Result<ComputeInstanceInfo>;
    fn destroy(&self) -> Result<()>;
}

/// Scoped NVML acquisition: `init` on construction, `shutdown` on drop.
pub struct InitGuard<'a> {
    nvml: &'a dyn Nvml,
}

impl<'a> InitGuard<'a> {
    pub fn new(nvml: &'a dyn Nvml) -> Result<Self> {
        nvml.init()?;
        Ok(Self { nvml })
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.nvml.shutdown() {
            log::debug!("NVML shutdown failed: {}", e);
        }
    }
}
