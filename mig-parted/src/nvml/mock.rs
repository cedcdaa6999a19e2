//! An in-memory model of a MIG-capable node, implementing the NVML
//! capability traits with placement-accurate GPU instance accounting so the
//! managers can be exercised without hardware.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{
    ComputeInstance, ComputeInstanceInfo, ComputeInstanceProfileInfo, Device, Error, GpuInstance,
    GpuInstanceInfo, GpuInstancePlacement, GpuInstanceProfileInfo, Nvml, Result,
};

pub const MOCK_A100_DEVICE_ID: u32 = 0x20B010DE;
pub const MOCK_A30_DEVICE_ID: u32 = 0x20B710DE;

#[derive(Clone)]
pub struct MockGiProfile {
    pub slice_count: u32,
    pub instance_count: u32,
    pub memory_size_mb: u64,
    pub placements: Vec<(u32, u32)>,
}

struct MockCi {
    id: u32,
    profile: u32,
    in_use: bool,
}

struct MockGi {
    id: u32,
    profile: u32,
    placement: (u32, u32),
    next_ci_id: u32,
    cis: BTreeMap<u32, MockCi>,
}

pub struct MockDeviceState {
    index: u32,
    uuid: String,
    name: String,
    pci_device_id: u32,
    pci_bus_id: String,
    mig_capable: bool,
    current_mode: u32,
    pending_mode: u32,
    // When set, mode changes stay pending until reset(), as on hardware
    // with driver clients attached.
    mode_change_pends: bool,
    gi_profiles: BTreeMap<u32, MockGiProfile>,
    next_gi_id: u32,
    gis: BTreeMap<u32, MockGi>,
}

impl MockDeviceState {
    pub fn a100(index: u32) -> Self {
        let gi_profiles = [
            (
                super::GPU_INSTANCE_PROFILE_1_SLICE,
                MockGiProfile {
                    slice_count: 1,
                    instance_count: 7,
                    memory_size_mb: 4864,
                    placements: (0..7).map(|s| (s, 1)).collect(),
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_2_SLICE,
                MockGiProfile {
                    slice_count: 2,
                    instance_count: 3,
                    memory_size_mb: 9856,
                    placements: vec![(0, 2), (2, 2), (4, 2)],
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_3_SLICE,
                MockGiProfile {
                    slice_count: 3,
                    instance_count: 2,
                    memory_size_mb: 19968,
                    placements: vec![(0, 4), (4, 4)],
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_4_SLICE,
                MockGiProfile {
                    slice_count: 4,
                    instance_count: 1,
                    memory_size_mb: 19968,
                    placements: vec![(0, 4)],
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_7_SLICE,
                MockGiProfile {
                    slice_count: 7,
                    instance_count: 1,
                    memory_size_mb: 40192,
                    placements: vec![(0, 8)],
                },
            ),
        ]
        .into_iter()
        .collect();

        Self::new(index, "A100-SXM4-40GB", MOCK_A100_DEVICE_ID, gi_profiles)
    }

    /// An A30 whose reported instance counts are deliberately wrong, as the
    /// driver reports them.
    pub fn a30(index: u32) -> Self {
        let gi_profiles = [
            (
                super::GPU_INSTANCE_PROFILE_1_SLICE,
                MockGiProfile {
                    slice_count: 1,
                    instance_count: 1,
                    memory_size_mb: 5952,
                    placements: (0..4).map(|s| (s, 1)).collect(),
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_1_SLICE_REV1,
                MockGiProfile {
                    slice_count: 1,
                    instance_count: 1,
                    memory_size_mb: 5952,
                    placements: vec![(0, 1)],
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_2_SLICE,
                MockGiProfile {
                    slice_count: 2,
                    instance_count: 1,
                    memory_size_mb: 12032,
                    placements: vec![(0, 2), (2, 2)],
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_2_SLICE_REV1,
                MockGiProfile {
                    slice_count: 2,
                    instance_count: 1,
                    memory_size_mb: 12032,
                    placements: vec![(0, 2)],
                },
            ),
            (
                super::GPU_INSTANCE_PROFILE_4_SLICE,
                MockGiProfile {
                    slice_count: 4,
                    instance_count: 1,
                    memory_size_mb: 24320,
                    placements: vec![(0, 4)],
                },
            ),
        ]
        .into_iter()
        .collect();

        Self::new(index, "A30", MOCK_A30_DEVICE_ID, gi_profiles)
    }

    fn new(
        index: u32,
        name: &str,
        pci_device_id: u32,
        gi_profiles: BTreeMap<u32, MockGiProfile>,
    ) -> Self {
        Self {
            index,
            uuid: format!("GPU-00000000-0000-0000-0000-{:012}", index),
            name: name.to_string(),
            pci_device_id,
            pci_bus_id: format!("00000000:{:02X}:00.0", 0x10 + index),
            mig_capable: true,
            current_mode: super::MIG_DISABLE,
            pending_mode: super::MIG_DISABLE,
            mode_change_pends: false,
            gi_profiles,
            next_gi_id: 1,
            gis: BTreeMap::new(),
        }
    }

    pub fn not_capable(index: u32) -> Self {
        let mut state = Self::new(index, "Tesla T4", 0x1EB8_10DE, BTreeMap::new());
        state.mig_capable = false;
        state
    }
}

pub struct MockNvml {
    devices: Vec<Arc<Mutex<MockDeviceState>>>,
}

impl MockNvml {
    pub fn new(devices: Vec<MockDeviceState>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|d| Arc::new(Mutex::new(d)))
                .collect(),
        }
    }

    /// A homogeneous node of A100-40GB boards.
    pub fn a100_node(count: u32) -> Self {
        Self::new((0..count).map(MockDeviceState::a100).collect())
    }

    fn state(&self, index: usize) -> &Arc<Mutex<MockDeviceState>> {
        &self.devices[index]
    }

    // Test controls below.

    pub fn set_mode(&self, index: usize, mode: u32) {
        let mut state = self.state(index).lock().unwrap();
        state.current_mode = mode;
        state.pending_mode = mode;
    }

    pub fn set_mode_change_pends(&self, index: usize, pends: bool) {
        self.state(index).lock().unwrap().mode_change_pends = pends;
    }

    /// Apply any pending mode change, as a GPU reset would.
    pub fn reset(&self, index: usize) {
        let mut state = self.state(index).lock().unwrap();
        if state.current_mode != state.pending_mode {
            state.current_mode = state.pending_mode;
            state.gis.clear();
        }
    }

    pub fn mode_change_pending(&self, index: usize) -> bool {
        let state = self.state(index).lock().unwrap();
        state.current_mode != state.pending_mode
    }

    /// Mark every compute instance under GPU instances of the given profile
    /// as busy, so destroying them fails with an in-use error.
    pub fn mark_cis_in_use(&self, index: usize, gi_profile: u32) {
        let mut state = self.state(index).lock().unwrap();
        for gi in state.gis.values_mut() {
            if gi.profile == gi_profile {
                for ci in gi.cis.values_mut() {
                    ci.in_use = true;
                }
            }
        }
    }

    pub fn release_cis(&self, index: usize) {
        let mut state = self.state(index).lock().unwrap();
        for gi in state.gis.values_mut() {
            for ci in gi.cis.values_mut() {
                ci.in_use = false;
            }
        }
    }

    pub fn gi_ids(&self, index: usize) -> Vec<u32> {
        self.state(index).lock().unwrap().gis.keys().copied().collect()
    }
}

impl Nvml for MockNvml {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.devices.len() as u32)
    }

    fn device_by_index(&self, index: u32) -> Result<Box<dyn Device>> {
        let state = self
            .devices
            .get(index as usize)
            .ok_or(Error::InvalidArgument)?;
        Ok(Box::new(MockDevice {
            state: Arc::clone(state),
        }))
    }
}

struct MockDevice {
    state: Arc<Mutex<MockDeviceState>>,
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

impl MockDevice {
    fn place(
        state: &MockDeviceState,
        profile: &MockGiProfile,
        requested: Option<(u32, u32)>,
    ) -> Result<(u32, u32)> {
        let occupied: Vec<(u32, u32)> = state.gis.values().map(|gi| gi.placement).collect();
        let candidates: Vec<(u32, u32)> = match requested {
            Some(placement) => {
                if !profile.placements.contains(&placement) {
                    return Err(Error::InvalidArgument);
                }
                vec![placement]
            }
            None => profile.placements.clone(),
        };
        candidates
            .into_iter()
            .find(|candidate| !occupied.iter().any(|used| overlaps(*candidate, *used)))
            .ok_or(Error::InsufficientResources)
    }

    fn create_gi(&self, info: &GpuInstanceProfileInfo, requested: Option<(u32, u32)>) -> Result<Box<dyn GpuInstance>> {
        let mut state = self.state.lock().unwrap();
        if state.current_mode != super::MIG_ENABLE {
            return Err(Error::InvalidArgument);
        }
        let profile = state
            .gi_profiles
            .get(&info.id)
            .cloned()
            .ok_or(Error::NotSupported)?;
        let existing = state.gis.values().filter(|gi| gi.profile == info.id).count();
        if existing as u32 >= profile.instance_count {
            return Err(Error::InsufficientResources);
        }
        let placement = Self::place(&state, &profile, requested)?;
        let id = state.next_gi_id;
        state.next_gi_id += 1;
        state.gis.insert(
            id,
            MockGi {
                id,
                profile: info.id,
                placement,
                next_ci_id: 1,
                cis: BTreeMap::new(),
            },
        );
        Ok(Box::new(MockGpuInstance {
            state: Arc::clone(&self.state),
            gi_id: id,
        }))
    }
}

impl Device for MockDevice {
    fn index(&self) -> Result<u32> {
        Ok(self.state.lock().unwrap().index)
    }

    fn uuid(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().uuid.clone())
    }

    fn name(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().name.clone())
    }

    fn pci_device_id(&self) -> Result<u32> {
        Ok(self.state.lock().unwrap().pci_device_id)
    }

    fn pci_bus_id(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().pci_bus_id.clone())
    }

    fn mig_mode(&self) -> Result<(u32, u32)> {
        let state = self.state.lock().unwrap();
        if !state.mig_capable {
            return Err(Error::NotSupported);
        }
        Ok((state.current_mode, state.pending_mode))
    }

    fn set_mig_mode(&self, mode: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.mig_capable {
            return Err(Error::NotSupported);
        }
        state.pending_mode = mode;
        if !state.mode_change_pends && state.current_mode != mode {
            state.current_mode = mode;
            state.gis.clear();
        }
        Ok(())
    }

    fn gpu_instance_profile_info(&self, profile: u32) -> Result<GpuInstanceProfileInfo> {
        let state = self.state.lock().unwrap();
        let info = state.gi_profiles.get(&profile).ok_or(Error::NotSupported)?;
        Ok(GpuInstanceProfileInfo {
            id: profile,
            slice_count: info.slice_count,
            instance_count: info.instance_count,
            multiprocessor_count: info.slice_count * 14,
            memory_size_mb: info.memory_size_mb,
        })
    }

    fn gpu_instances(&self, info: &GpuInstanceProfileInfo) -> Result<Vec<Box<dyn GpuInstance>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .gis
            .values()
            .filter(|gi| gi.profile == info.id)
            .map(|gi| {
                Box::new(MockGpuInstance {
                    state: Arc::clone(&self.state),
                    gi_id: gi.id,
                }) as Box<dyn GpuInstance>
            })
            .collect())
    }

    fn create_gpu_instance(&self, info: &GpuInstanceProfileInfo) -> Result<Box<dyn GpuInstance>> {
        self.create_gi(info, None)
    }

    fn create_gpu_instance_with_placement(
        &self,
        info: &GpuInstanceProfileInfo,
        placement: &GpuInstancePlacement,
    ) -> Result<Box<dyn GpuInstance>> {
        self.create_gi(info, Some((placement.start, placement.size)))
    }
}

struct MockGpuInstance {
    state: Arc<Mutex<MockDeviceState>>,
    gi_id: u32,
}

impl std::fmt::Debug for MockGpuInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGpuInstance")
            .field("gi_id", &self.gi_id)
            .finish()
    }
}

fn ci_slice_count(profile: u32) -> Option<u32> {
    match profile {
        super::COMPUTE_INSTANCE_PROFILE_1_SLICE => Some(1),
        super::COMPUTE_INSTANCE_PROFILE_2_SLICE => Some(2),
        super::COMPUTE_INSTANCE_PROFILE_3_SLICE => Some(3),
        super::COMPUTE_INSTANCE_PROFILE_4_SLICE => Some(4),
        super::COMPUTE_INSTANCE_PROFILE_7_SLICE => Some(7),
        super::COMPUTE_INSTANCE_PROFILE_8_SLICE => Some(8),
        super::COMPUTE_INSTANCE_PROFILE_6_SLICE => Some(6),
        _ => None,
    }
}

impl GpuInstance for MockGpuInstance {
    fn info(&self) -> Result<GpuInstanceInfo> {
        let state = self.state.lock().unwrap();
        let gi = state.gis.get(&self.gi_id).ok_or(Error::NotFound)?;
        Ok(GpuInstanceInfo {
            id: gi.id,
            profile_id: gi.profile,
            placement: GpuInstancePlacement {
                start: gi.placement.0,
                size: gi.placement.1,
            },
        })
    }

    fn compute_instance_profile_info(
        &self,
        profile: u32,
        eng_profile: u32,
    ) -> Result<ComputeInstanceProfileInfo> {
        if eng_profile != super::COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED {
            return Err(Error::NotSupported);
        }
        let state = self.state.lock().unwrap();
        let gi = state.gis.get(&self.gi_id).ok_or(Error::NotFound)?;
        let gi_slices = state.gi_profiles[&gi.profile].slice_count;
        let slices = ci_slice_count(profile).ok_or(Error::NotSupported)?;
        if slices > gi_slices {
            return Err(Error::NotSupported);
        }
        Ok(ComputeInstanceProfileInfo {
            id: profile,
            slice_count: slices,
            instance_count: gi_slices / slices,
        })
    }

    fn compute_instances(
        &self,
        info: &ComputeInstanceProfileInfo,
    ) -> Result<Vec<Box<dyn ComputeInstance>>> {
        let state = self.state.lock().unwrap();
        let gi = state.gis.get(&self.gi_id).ok_or(Error::NotFound)?;
        Ok(gi
            .cis
            .values()
            .filter(|ci| ci.profile == info.id)
            .map(|ci| {
                Box::new(MockComputeInstance {
                    state: Arc::clone(&self.state),
                    gi_id: self.gi_id,
                    ci_id: ci.id,
                }) as Box<dyn ComputeInstance>
            })
            .collect())
    }

    fn create_compute_instance(
        &self,
        info: &ComputeInstanceProfileInfo,
    ) -> Result<Box<dyn ComputeInstance>> {
        let mut state = self.state.lock().unwrap();
        let gi = state.gis.get(&self.gi_id).ok_or(Error::NotFound)?;
        let gi_slices = state.gi_profiles[&gi.profile].slice_count;
        let used: u32 = gi
            .cis
            .values()
            .filter_map(|ci| ci_slice_count(ci.profile))
            .sum();
        if used + info.slice_count > gi_slices {
            return Err(Error::InsufficientResources);
        }
        let gi = state.gis.get_mut(&self.gi_id).ok_or(Error::NotFound)?;
        let id = gi.next_ci_id;
        gi.next_ci_id += 1;
        gi.cis.insert(
            id,
            MockCi {
                id,
                profile: info.id,
                in_use: false,
            },
        );
        Ok(Box::new(MockComputeInstance {
            state: Arc::clone(&self.state),
            gi_id: self.gi_id,
            ci_id: id,
        }))
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let gi = state.gis.get(&self.gi_id).ok_or(Error::NotFound)?;
        if !gi.cis.is_empty() {
            return Err(Error::InUse);
        }
        state.gis.remove(&self.gi_id);
        Ok(())
    }
}

struct MockComputeInstance {
    state: Arc<Mutex<MockDeviceState>>,
    gi_id: u32,
    ci_id: u32,
}

impl ComputeInstance for MockComputeInstance {
    fn info(&self) -> Result<ComputeInstanceInfo> {
        let state = self.state.lock().unwrap();
        let gi = state.gis.get(&self.gi_id).ok_or(Error::NotFound)?;
        let ci = gi.cis.get(&self.ci_id).ok_or(Error::NotFound)?;
        Ok(ComputeInstanceInfo {
            id: ci.id,
            profile_id: ci.profile,
        })
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let gi = state.gis.get_mut(&self.gi_id).ok_or(Error::NotFound)?;
        let ci = gi.cis.get(&self.ci_id).ok_or(Error::NotFound)?;
        if ci.in_use {
            return Err(Error::InUse);
        }
        gi.cis.remove(&self.ci_id);
        Ok(())
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::super::*;
    use super::*;

    #[test]
    fn placement_exhaustion_depends_on_order() {
        let nvml = MockNvml::a100_node(1);
        nvml.set_mode(0, MIG_ENABLE);
        let device = nvml.device_by_index(0).unwrap();

        // Creating the large instance first leaves no room for two small
        // ones next to the medium one.
        let p3 = device
            .gpu_instance_profile_info(GPU_INSTANCE_PROFILE_3_SLICE)
            .unwrap();
        let p2 = device
            .gpu_instance_profile_info(GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        let p1 = device
            .gpu_instance_profile_info(GPU_INSTANCE_PROFILE_1_SLICE)
            .unwrap();

        device.create_gpu_instance(&p3).unwrap();
        device.create_gpu_instance(&p2).unwrap();
        device.create_gpu_instance(&p1).unwrap();
        assert_eq!(
            device.create_gpu_instance(&p1).unwrap_err(),
            Error::InsufficientResources
        );
    }

    #[test]
    fn gi_with_cis_cannot_be_destroyed() {
        let nvml = MockNvml::a100_node(1);
        nvml.set_mode(0, MIG_ENABLE);
        let device = nvml.device_by_index(0).unwrap();
        let p7 = device
            .gpu_instance_profile_info(GPU_INSTANCE_PROFILE_7_SLICE)
            .unwrap();
        let gi = device.create_gpu_instance(&p7).unwrap();
        let ci_info = gi
            .compute_instance_profile_info(
                COMPUTE_INSTANCE_PROFILE_7_SLICE,
                COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
            )
            .unwrap();
        let ci = gi.create_compute_instance(&ci_info).unwrap();
        assert_eq!(gi.destroy().unwrap_err(), Error::InUse);
        ci.destroy().unwrap();
        gi.destroy().unwrap();
    }
}
