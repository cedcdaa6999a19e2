//! Per-GPU MIG instance layout control: enumerate the current layout,
//! clear it, and drive the hardware into a requested profile multiset.
//!
//! The hardware rejects some creation orders even when the requested
//! multiset fits, so `set_mig_config` searches creation orders until one
//! succeeds. Compute instances that are busy are spared together with
//! their parent GPU instance when the requested layout asks for that
//! parent profile anyway.

use log::debug;
use snafu::{ensure, ResultExt};

use crate::nvml::{self, InitGuard, Nvml};
use crate::types::{MigConfig, MigProfile};

pub trait MigConfigManager {
    fn get_mig_config(&self, gpu: usize) -> Result<MigConfig>;
    fn set_mig_config(&self, gpu: usize, config: &MigConfig) -> Result<()>;
    fn clear_mig_config(&self, gpu: usize) -> Result<()>;
}

pub struct NvmlMigConfigManager<'a> {
    nvml: &'a dyn Nvml,
}

impl<'a> NvmlMigConfigManager<'a> {
    pub fn new(nvml: &'a dyn Nvml) -> Self {
        Self { nvml }
    }

    fn device(&self, gpu: usize) -> Result<Box<dyn nvml::Device>> {
        self.nvml
            .device_by_index(gpu as u32)
            .context(error::NvmlSnafu {
                op: "get device handle",
                gpu,
            })
    }

    fn ensure_mig_enabled(&self, gpu: usize, device: &dyn nvml::Device) -> Result<()> {
        let (current, _) = match device.mig_mode() {
            Ok(modes) => modes,
            Err(nvml::Error::NotSupported) => return error::NotCapableSnafu { gpu }.fail(),
            Err(source) => {
                return Err(source).context(error::NvmlSnafu {
                    op: "get MIG mode",
                    gpu,
                })
            }
        };
        ensure!(current == nvml::MIG_ENABLE, error::ModeDisabledSnafu { gpu });
        Ok(())
    }

    /// Every existing GPU instance, tagged with the profile index it was
    /// found under.
    fn existing_gpu_instances(
        &self,
        gpu: usize,
        device: &dyn nvml::Device,
    ) -> Result<Vec<(u32, nvml::GpuInstanceProfileInfo, Box<dyn nvml::GpuInstance>)>> {
        let mut found = Vec::new();
        for gi_profile in 0..nvml::GPU_INSTANCE_PROFILE_COUNT {
            let info = match device.gpu_instance_profile_info(gi_profile) {
                Ok(info) => info,
                Err(nvml::Error::NotSupported) | Err(nvml::Error::InvalidArgument) => continue,
                Err(source) => {
                    return Err(source).context(error::NvmlSnafu {
                        op: "get GPU instance profile info",
                        gpu,
                    })
                }
            };
            let gis = device.gpu_instances(&info).context(error::NvmlSnafu {
                op: "enumerate GPU instances",
                gpu,
            })?;
            for gi in gis {
                found.push((gi_profile, info, gi));
            }
        }
        Ok(found)
    }

    /// Every compute instance under a GPU instance, tagged with its
    /// (profile, engine profile) indices.
    fn existing_compute_instances(
        &self,
        gpu: usize,
        gi: &dyn nvml::GpuInstance,
    ) -> Result<Vec<(u32, u32, Box<dyn nvml::ComputeInstance>)>> {
        let mut found = Vec::new();
        for ci_profile in 0..nvml::COMPUTE_INSTANCE_PROFILE_COUNT {
            for eng_profile in 0..nvml::COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT {
                let info = match gi.compute_instance_profile_info(ci_profile, eng_profile) {
                    Ok(info) => info,
                    Err(nvml::Error::NotSupported) | Err(nvml::Error::InvalidArgument) => continue,
                    Err(source) => {
                        return Err(source).context(error::NvmlSnafu {
                            op: "get compute instance profile info",
                            gpu,
                        })
                    }
                };
                let cis = gi.compute_instances(&info).context(error::NvmlSnafu {
                    op: "enumerate compute instances",
                    gpu,
                })?;
                for ci in cis {
                    found.push((ci_profile, eng_profile, ci));
                }
            }
        }
        Ok(found)
    }

    fn current_config(&self, gpu: usize, device: &dyn nvml::Device) -> Result<MigConfig> {
        let mut config = MigConfig::new();
        for (gi_profile, gi_info, gi) in self.existing_gpu_instances(gpu, device)? {
            for (ci_profile, _, _) in self.existing_compute_instances(gpu, gi.as_ref())? {
                let profile =
                    MigProfile::from_ids(gi_profile, ci_profile, gi_info.memory_size_mb)
                        .context(error::ProfileSnafu)?;
                let count = config.count(&profile);
                config.set(profile, count + 1);
            }
        }
        Ok(config)
    }

    /// Destroy the existing layout, sparing the parent GPU instance of any
    /// busy compute instance when an unreserved `desired` entry names the
    /// same GPU instance profile. Returns the multiset of `desired` entries
    /// still to be created.
    fn clear_for_set(
        &self,
        gpu: usize,
        device: &dyn nvml::Device,
        desired: &MigConfig,
    ) -> Result<Vec<MigProfile>> {
        let flat = desired.flatten();
        let mut reserved = vec![false; flat.len()];

        for (gi_profile, _, gi) in self.existing_gpu_instances(gpu, device)? {
            let mut spared = false;
            for (_, _, ci) in self.existing_compute_instances(gpu, gi.as_ref())? {
                match ci.destroy() {
                    Ok(()) => {}
                    Err(nvml::Error::InUse) if !flat.is_empty() => {
                        let slot = flat.iter().enumerate().find(|&(index, profile)| {
                            !reserved[index]
                                && matches!(
                                    profile.profile_ids(),
                                    Ok((gi_id, _, _)) if gi_id == gi_profile
                                )
                        });
                        match slot {
                            Some((index, profile)) => {
                                debug!(
                                    "sparing busy GPU instance on GPU {} in place of {}",
                                    gpu, profile
                                );
                                reserved[index] = true;
                                spared = true;
                            }
                            None => {
                                return Err(nvml::Error::InUse).context(error::NvmlSnafu {
                                    op: "destroy compute instance",
                                    gpu,
                                })
                            }
                        }
                    }
                    Err(source) => {
                        return Err(source).context(error::NvmlSnafu {
                            op: "destroy compute instance",
                            gpu,
                        })
                    }
                }
            }
            if !spared {
                gi.destroy().context(error::NvmlSnafu {
                    op: "destroy GPU instance",
                    gpu,
                })?;
            }
        }

        Ok(flat
            .into_iter()
            .zip(reserved)
            .filter(|(_, reserved)| !reserved)
            .map(|(profile, _)| profile)
            .collect())
    }

    fn create_compute_instance(
        &self,
        gpu: usize,
        gi: &dyn nvml::GpuInstance,
        ci_id: u32,
        eng_id: u32,
    ) -> Result<()> {
        let ci_info = gi
            .compute_instance_profile_info(ci_id, eng_id)
            .context(error::NvmlSnafu {
                op: "get compute instance profile info",
                gpu,
            })?;
        gi.create_compute_instance(&ci_info)
            .context(error::NvmlSnafu {
                op: "create compute instance",
                gpu,
            })?;
        Ok(())
    }

    /// Create `remaining` (a sub-multiset of the permutation) in the order
    /// the permutation dictates.
    fn create_instances(
        &self,
        gpu: usize,
        device: &dyn nvml::Device,
        permutation: &[MigProfile],
        remaining: &[MigProfile],
    ) -> Result<()> {
        let mut wanted: MigConfig = remaining.iter().cloned().map(|p| (p, 1)).collect();
        let mut previous: Option<(u32, Box<dyn nvml::GpuInstance>)> = None;

        for profile in permutation {
            if wanted.count(profile) == 0 {
                continue;
            }
            wanted.set(profile.clone(), wanted.count(profile) - 1);

            let (gi_id, ci_id, eng_id) = profile.profile_ids().context(error::ProfileSnafu)?;
            let gi_info = device
                .gpu_instance_profile_info(gi_id)
                .context(error::NvmlSnafu {
                    op: "get GPU instance profile info",
                    gpu,
                })?;

            // A wrong profile-id alias shows up as a different memory size
            // than the one the config named.
            let realized = MigProfile::from_ids(gi_id, ci_id, gi_info.memory_size_mb)
                .context(error::ProfileSnafu)?;
            ensure!(
                realized == *profile,
                error::ProfileMismatchSnafu {
                    requested: profile.to_string(),
                    realized: realized.to_string(),
                }
            );

            // Reuse the previous GPU instance when the profile lands on the
            // same GI profile; fall back to a fresh one on any failure.
            if let Some((previous_id, previous_gi)) = &previous {
                if *previous_id == gi_id {
                    match self.create_compute_instance(gpu, previous_gi.as_ref(), ci_id, eng_id) {
                        Ok(()) => continue,
                        Err(e) => debug!("unable to reuse existing GPU instance: {}", e),
                    }
                }
            }

            let gi = device
                .create_gpu_instance(&gi_info)
                .context(error::NvmlSnafu {
                    op: "create GPU instance",
                    gpu,
                })?;
            self.create_compute_instance(gpu, gi.as_ref(), ci_id, eng_id)?;
            previous = Some((gi_id, gi));
        }
        Ok(())
    }

    fn try_permutation(
        &self,
        gpu: usize,
        device: &dyn nvml::Device,
        desired: &MigConfig,
        permutation: &[MigProfile],
    ) -> Result<()> {
        // One re-clear is allowed when instances survive a clear pass.
        for clear_attempt in 0..2 {
            if clear_attempt > 0 {
                debug!("stale MIG devices after creation on GPU {}; clearing again", gpu);
            }
            let remaining = self.clear_for_set(gpu, device, desired)?;
            // Spared instances satisfy their entries with whatever compute
            // split they already carry, so the check below runs against the
            // survivors plus the entries still to be created.
            let mut expected = self.current_config(gpu, device)?;
            for profile in &remaining {
                let count = expected.count(profile);
                expected.set(profile.clone(), count + 1);
            }

            self.create_instances(gpu, device, permutation, &remaining)?;
            if self.current_config(gpu, device)?.equals(&expected) {
                return Ok(());
            }
        }
        error::ClearLimitExceededSnafu { gpu }.fail()
    }
}

impl MigConfigManager for NvmlMigConfigManager<'_> {
    fn get_mig_config(&self, gpu: usize) -> Result<MigConfig> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        let device = self.device(gpu)?;
        self.ensure_mig_enabled(gpu, device.as_ref())?;
        self.current_config(gpu, device.as_ref())
    }

    fn set_mig_config(&self, gpu: usize, config: &MigConfig) -> Result<()> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        let device = self.device(gpu)?;
        self.ensure_mig_enabled(gpu, device.as_ref())?;
        config.assert_valid().context(error::InvalidConfigSnafu)?;

        let mut sequence = config.flatten();
        let mut fatal = None;
        let satisfied = for_each_unique_permutation(&mut sequence, &mut |permutation| {
            match self.try_permutation(gpu, device.as_ref(), config, permutation) {
                Ok(()) => true,
                Err(e @ Error::ClearLimitExceeded { .. }) => {
                    fatal = Some(e);
                    true
                }
                Err(e) => {
                    debug!("creation order failed on GPU {}: {}", gpu, e);
                    false
                }
            }
        });

        if let Some(e) = fatal {
            self.best_effort_clear(gpu, device.as_ref());
            return Err(e);
        }
        if !satisfied {
            self.best_effort_clear(gpu, device.as_ref());
            return error::UnsatisfiableSnafu { gpu }.fail();
        }
        Ok(())
    }

    fn clear_mig_config(&self, gpu: usize) -> Result<()> {
        let _nvml = InitGuard::new(self.nvml).context(error::NvmlSnafu { op: "init", gpu })?;
        let device = self.device(gpu)?;
        self.ensure_mig_enabled(gpu, device.as_ref())?;
        self.clear_for_set(gpu, device.as_ref(), &MigConfig::new())?;
        Ok(())
    }
}

impl NvmlMigConfigManager<'_> {
    /// Avoid leaving a half-created layout behind; the original error is
    /// the one the caller sees.
    fn best_effort_clear(&self, gpu: usize, device: &dyn nvml::Device) {
        if let Err(e) = self.clear_for_set(gpu, device, &MigConfig::new()) {
            debug!("unable to clear GPU {} after failed config set: {}", gpu, e);
        }
    }
}

/// Enumerate the unique permutations of `sequence` in lexicographic swap
/// order, calling `visit` for each until it returns `true`. An element is
/// only swapped into position `i` when no equal element sits between the
/// two positions, which skips duplicate orders.
fn for_each_unique_permutation<T, F>(sequence: &mut [T], visit: &mut F) -> bool
where
    T: PartialEq,
    F: FnMut(&[T]) -> bool,
{
    fn recurse<T: PartialEq, F: FnMut(&[T]) -> bool>(
        sequence: &mut [T],
        position: usize,
        visit: &mut F,
    ) -> bool {
        if position == sequence.len() {
            return visit(sequence);
        }
        for candidate in position..sequence.len() {
            if (position..candidate).any(|k| sequence[k] == sequence[candidate]) {
                continue;
            }
            sequence.swap(position, candidate);
            let done = recurse(sequence, position + 1, visit);
            sequence.swap(position, candidate);
            if done {
                return true;
            }
        }
        false
    }
    recurse(sequence, 0, visit)
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("GPU {} is not MIG capable", gpu))]
        NotCapable { gpu: usize },

        #[snafu(display("MIG mode is disabled on GPU {}", gpu))]
        ModeDisabled { gpu: usize },

        #[snafu(display("Invalid MIG config: {}", source))]
        InvalidConfig {
            source: crate::types::config::Error,
        },

        #[snafu(display("Invalid MIG profile: {}", source))]
        Profile {
            source: crate::types::profile::Error,
        },

        #[snafu(display(
            "Requested profile {} but hardware realizes {}",
            requested,
            realized
        ))]
        ProfileMismatch { requested: String, realized: String },

        #[snafu(display("Unable to {} for GPU {}: {}", op, gpu, source))]
        Nvml {
            op: String,
            gpu: usize,
            source: crate::nvml::Error,
        },

        #[snafu(display("No creation order satisfies the requested config on GPU {}", gpu))]
        Unsatisfiable { gpu: usize },

        #[snafu(display("Stale MIG devices remain on GPU {} after repeated clears", gpu))]
        ClearLimitExceeded { gpu: usize },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
