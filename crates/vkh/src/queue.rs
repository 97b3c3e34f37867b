//! Queue family resolution.

use crate::error::{GpuError, Result};
use ash::vk;
use std::fmt;

/// The three queue roles a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Transfer,
    Present,
}

impl QueueRole {
    /// All roles in resolution order.
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Transfer, Self::Present];
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Graphics => "graphics",
            Self::Transfer => "transfer",
            Self::Present => "present",
        };
        f.write_str(name)
    }
}

/// Resolved family index for each queue role. Roles may share a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Family index serving the given role.
    pub fn family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Transfer => self.transfer,
            QueueRole::Present => self.present,
        }
    }

    /// Distinct families in first-seen order, one entry per queue to create.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for role in QueueRole::ALL {
            let family = self.family(role);
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }

    /// Whether graphics and transfer work run on different families.
    pub fn transfer_is_separate(&self) -> bool {
        self.graphics != self.transfer
    }

    /// Whether presentation happens on a different family than rendering.
    pub fn present_is_separate(&self) -> bool {
        self.graphics != self.present
    }
}

/// Pick the first family for each role.
///
/// `present_support[i]` says whether family `i` can present to the target
/// surface. A family only counts if it exposes at least one queue.
pub fn resolve_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> Result<QueueFamilyIndices> {
    let first_with = |flag: vk::QueueFlags| {
        families
            .iter()
            .position(|f| f.queue_count > 0 && f.queue_flags.contains(flag))
            .map(|i| i as u32)
    };

    let graphics = first_with(vk::QueueFlags::GRAPHICS)
        .ok_or(GpuError::QueueFamilyUnresolved(QueueRole::Graphics))?;
    let transfer = first_with(vk::QueueFlags::TRANSFER)
        .ok_or(GpuError::QueueFamilyUnresolved(QueueRole::Transfer))?;
    let present = families
        .iter()
        .zip(present_support)
        .position(|(f, &supported)| f.queue_count > 0 && supported)
        .map(|i| i as u32)
        .ok_or(GpuError::QueueFamilyUnresolved(QueueRole::Present))?;

    Ok(QueueFamilyIndices {
        graphics,
        transfer,
        present,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn single_universal_family() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            16,
        )];
        let indices = resolve_queue_families(&families, &[true]).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                transfer: 0,
                present: 0
            }
        );
        assert_eq!(indices.unique(), vec![0]);
        assert!(!indices.transfer_is_separate());
    }

    #[test]
    fn picks_first_family_per_role() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 2),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let indices = resolve_queue_families(&families, &[true, false, false]).unwrap();
        assert_eq!(indices.graphics, 1);
        assert_eq!(indices.transfer, 1);
        assert_eq!(indices.present, 0);
        assert_eq!(indices.unique(), vec![1, 0]);
        assert!(indices.present_is_separate());
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 0),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 4),
        ];
        let indices = resolve_queue_families(&families, &[true, true]).unwrap();
        assert_eq!(indices.graphics, 1);
        assert_eq!(indices.present, 1);
    }

    #[test]
    fn resolution_is_idempotent() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        let support = [false, true];
        let first = resolve_queue_families(&families, &support).unwrap();
        let second = resolve_queue_families(&families, &support).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.unique(), vec![0, 1]);
    }

    #[test]
    fn missing_role_fails() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1)];
        let err = resolve_queue_families(&families, &[true]).unwrap_err();
        assert!(matches!(
            err,
            GpuError::QueueFamilyUnresolved(QueueRole::Graphics)
        ));

        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1)];
        let err = resolve_queue_families(&families, &[false]).unwrap_err();
        assert!(matches!(
            err,
            GpuError::QueueFamilyUnresolved(QueueRole::Present)
        ));
    }
}
