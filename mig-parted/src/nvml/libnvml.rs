//! The [`Nvml`] capability backed by `libnvidia-ml.so.1`, loaded at runtime
//! through the generated `nvml-wrapper-sys` bindings.

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::raw::{c_char, c_uint};
use std::ptr;
use std::sync::Arc;

use nvml_wrapper_sys::bindings::{
    nvmlComputeInstanceInfo_t, nvmlComputeInstance_t, nvmlComputeInstanceProfileInfo_t,
    nvmlDevice_t, nvmlGpuInstanceInfo_t, nvmlGpuInstancePlacement_t,
    nvmlGpuInstanceProfileInfo_t, nvmlGpuInstance_t, nvmlPciInfo_t, nvmlReturn_t, NvmlLib,
};

use super::{
    ComputeInstance, ComputeInstanceInfo, ComputeInstanceProfileInfo, Device, Error, GpuInstance,
    GpuInstanceInfo, GpuInstancePlacement, GpuInstanceProfileInfo, Nvml, Result,
};

const NVML_SO: &str = "libnvidia-ml.so.1";

// NVML_DEVICE_UUID_V2_BUFFER_SIZE / NVML_DEVICE_NAME_V2_BUFFER_SIZE.
const STRING_BUFFER_SIZE: usize = 96;

fn check(ret: nvmlReturn_t) -> Result<()> {
    match ret {
        0 => Ok(()),
        code => Err(Error::from_code(code as u32)),
    }
}

fn string_from_buffer(buffer: &[c_char]) -> Result<String> {
    let cstr = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    cstr.to_str()
        .map(str::to_string)
        .map_err(|_| Error::Unknown(0))
}

/// The dynamically loaded NVML library.
pub struct LibNvml {
    lib: Arc<NvmlLib>,
}

impl LibNvml {
    pub fn new() -> Result<Self> {
        let lib = unsafe { NvmlLib::new(NVML_SO) }.map_err(|_| Error::LibraryNotFound)?;
        Ok(Self { lib: Arc::new(lib) })
    }
}

impl Nvml for LibNvml {
    fn init(&self) -> Result<()> {
        check(unsafe { self.lib.nvmlInit_v2() })
    }

    fn shutdown(&self) -> Result<()> {
        check(unsafe { self.lib.nvmlShutdown() })
    }

    fn device_count(&self) -> Result<u32> {
        let mut count: c_uint = 0;
        check(unsafe { self.lib.nvmlDeviceGetCount_v2(&mut count) })?;
        Ok(count)
    }

    fn device_by_index(&self, index: u32) -> Result<Box<dyn Device>> {
        let mut handle: nvmlDevice_t = ptr::null_mut();
        check(unsafe { self.lib.nvmlDeviceGetHandleByIndex_v2(index, &mut handle) })?;
        Ok(Box::new(LibDevice {
            lib: Arc::clone(&self.lib),
            handle,
        }))
    }
}

struct LibDevice {
    lib: Arc<NvmlLib>,
    handle: nvmlDevice_t,
}

impl Device for LibDevice {
    fn index(&self) -> Result<u32> {
        let mut index: c_uint = 0;
        check(unsafe { self.lib.nvmlDeviceGetIndex(self.handle, &mut index) })?;
        Ok(index)
    }

    fn uuid(&self) -> Result<String> {
        let mut buffer = [0 as c_char; STRING_BUFFER_SIZE];
        check(unsafe {
            self.lib
                .nvmlDeviceGetUUID(self.handle, buffer.as_mut_ptr(), STRING_BUFFER_SIZE as c_uint)
        })?;
        string_from_buffer(&buffer)
    }

    fn name(&self) -> Result<String> {
        let mut buffer = [0 as c_char; STRING_BUFFER_SIZE];
        check(unsafe {
            self.lib
                .nvmlDeviceGetName(self.handle, buffer.as_mut_ptr(), STRING_BUFFER_SIZE as c_uint)
        })?;
        string_from_buffer(&buffer)
    }

    fn pci_device_id(&self) -> Result<u32> {
        let mut info: nvmlPciInfo_t = unsafe { MaybeUninit::zeroed().assume_init() };
        check(unsafe { self.lib.nvmlDeviceGetPciInfo_v3(self.handle, &mut info) })?;
        Ok(info.pciDeviceId)
    }

    fn pci_bus_id(&self) -> Result<String> {
        let mut info: nvmlPciInfo_t = unsafe { MaybeUninit::zeroed().assume_init() };
        check(unsafe { self.lib.nvmlDeviceGetPciInfo_v3(self.handle, &mut info) })?;
        string_from_buffer(&info.busId)
    }

    fn mig_mode(&self) -> Result<(u32, u32)> {
        let mut current: c_uint = 0;
        let mut pending: c_uint = 0;
        check(unsafe {
            self.lib
                .nvmlDeviceGetMigMode(self.handle, &mut current, &mut pending)
        })?;
        Ok((current, pending))
    }

    fn set_mig_mode(&self, mode: u32) -> Result<()> {
        let mut activation: nvmlReturn_t = 0;
        check(unsafe {
            self.lib
                .nvmlDeviceSetMigMode(self.handle, mode, &mut activation)
        })?;
        // An in-use activation status leaves the change pending until the
        // next GPU reset; callers observe that through mig_mode().
        match check(activation) {
            Ok(()) | Err(Error::InUse) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn gpu_instance_profile_info(&self, profile: u32) -> Result<GpuInstanceProfileInfo> {
        let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { MaybeUninit::zeroed().assume_init() };
        check(unsafe {
            self.lib
                .nvmlDeviceGetGpuInstanceProfileInfo(self.handle, profile, &mut info)
        })?;
        Ok(GpuInstanceProfileInfo {
            id: info.id,
            slice_count: info.sliceCount,
            instance_count: info.instanceCount,
            multiprocessor_count: info.multiprocessorCount,
            memory_size_mb: info.memorySizeMB,
        })
    }

    fn gpu_instances(&self, info: &GpuInstanceProfileInfo) -> Result<Vec<Box<dyn GpuInstance>>> {
        let mut handles: Vec<nvmlGpuInstance_t> =
            vec![ptr::null_mut(); info.instance_count as usize];
        let mut count: c_uint = info.instance_count;
        check(unsafe {
            self.lib
                .nvmlDeviceGetGpuInstances(self.handle, info.id, handles.as_mut_ptr(), &mut count)
        })?;
        handles.truncate(count as usize);
        Ok(handles
            .into_iter()
            .map(|handle| {
                Box::new(LibGpuInstance {
                    lib: Arc::clone(&self.lib),
                    handle,
                }) as Box<dyn GpuInstance>
            })
            .collect())
    }

    fn create_gpu_instance(&self, info: &GpuInstanceProfileInfo) -> Result<Box<dyn GpuInstance>> {
        let mut handle: nvmlGpuInstance_t = ptr::null_mut();
        check(unsafe {
            self.lib
                .nvmlDeviceCreateGpuInstance(self.handle, info.id, &mut handle)
        })?;
        Ok(Box::new(LibGpuInstance {
            lib: Arc::clone(&self.lib),
            handle,
        }))
    }

    fn create_gpu_instance_with_placement(
        &self,
        info: &GpuInstanceProfileInfo,
        placement: &GpuInstancePlacement,
    ) -> Result<Box<dyn GpuInstance>> {
        let raw = nvmlGpuInstancePlacement_t {
            start: placement.start,
            size: placement.size,
        };
        let mut handle: nvmlGpuInstance_t = ptr::null_mut();
        check(unsafe {
            self.lib.nvmlDeviceCreateGpuInstanceWithPlacement(
                self.handle,
                info.id,
                &raw,
                &mut handle,
            )
        })?;
        Ok(Box::new(LibGpuInstance {
            lib: Arc::clone(&self.lib),
            handle,
        }))
    }
}

struct LibGpuInstance {
    lib: Arc<NvmlLib>,
    handle: nvmlGpuInstance_t,
}

impl std::fmt::Debug for LibGpuInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibGpuInstance")
            .field("handle", &self.handle)
            .finish()
    }
}

impl GpuInstance for LibGpuInstance {
    fn info(&self) -> Result<GpuInstanceInfo> {
        let mut info: nvmlGpuInstanceInfo_t = unsafe { MaybeUninit::zeroed().assume_init() };
        check(unsafe { self.lib.nvmlGpuInstanceGetInfo(self.handle, &mut info) })?;
        Ok(GpuInstanceInfo {
            id: info.id,
            profile_id: info.profileId,
            placement: GpuInstancePlacement {
                start: info.placement.start,
                size: info.placement.size,
            },
        })
    }

    fn compute_instance_profile_info(
        &self,
        profile: u32,
        eng_profile: u32,
    ) -> Result<ComputeInstanceProfileInfo> {
        let mut info: nvmlComputeInstanceProfileInfo_t =
            unsafe { MaybeUninit::zeroed().assume_init() };
        check(unsafe {
            self.lib.nvmlGpuInstanceGetComputeInstanceProfileInfo(
                self.handle,
                profile,
                eng_profile,
                &mut info,
            )
        })?;
        Ok(ComputeInstanceProfileInfo {
            id: info.id,
            slice_count: info.sliceCount,
            instance_count: info.instanceCount,
        })
    }

    fn compute_instances(
        &self,
        info: &ComputeInstanceProfileInfo,
    ) -> Result<Vec<Box<dyn ComputeInstance>>> {
        let mut handles: Vec<nvmlComputeInstance_t> =
            vec![ptr::null_mut(); info.instance_count as usize];
        let mut count: c_uint = info.instance_count;
        check(unsafe {
            self.lib.nvmlGpuInstanceGetComputeInstances(
                self.handle,
                info.id,
                handles.as_mut_ptr(),
                &mut count,
            )
        })?;
        handles.truncate(count as usize);
        Ok(handles
            .into_iter()
            .map(|handle| {
                Box::new(LibComputeInstance {
                    lib: Arc::clone(&self.lib),
                    handle,
                }) as Box<dyn ComputeInstance>
            })
            .collect())
    }

    fn create_compute_instance(
        &self,
        info: &ComputeInstanceProfileInfo,
    ) -> Result<Box<dyn ComputeInstance>> {
        let mut handle: nvmlComputeInstance_t = ptr::null_mut();
        check(unsafe {
            self.lib
                .nvmlGpuInstanceCreateComputeInstance(self.handle, info.id, &mut handle)
        })?;
        Ok(Box::new(LibComputeInstance {
            lib: Arc::clone(&self.lib),
            handle,
        }))
    }

    fn destroy(&self) -> Result<()> {
        check(unsafe { self.lib.nvmlGpuInstanceDestroy(self.handle) })
    }
}

struct LibComputeInstance {
    lib: Arc<NvmlLib>,
    handle: nvmlComputeInstance_t,
}

impl ComputeInstance for LibComputeInstance {
    fn info(&self) -> Result<ComputeInstanceInfo> {
        let mut info: nvmlComputeInstanceInfo_t = unsafe { MaybeUninit::zeroed().assume_init() };
        check(unsafe { self.lib.nvmlComputeInstanceGetInfo_v2(self.handle, &mut info) })?;
        Ok(ComputeInstanceInfo {
            id: info.id,
            profile_id: info.profileId,
        })
    }

    fn destroy(&self) -> Result<()> {
        check(unsafe { self.lib.nvmlComputeInstanceDestroy(self.handle) })
    }
}
