//! Descriptor pool sizing, set layouts and writes.

use crate::error::{GpuError, Result};
use ash::vk;

/// Caller-supplied `{descriptor type -> max count}` table for the context pool.
///
/// The pool can hold as many sets as the summed counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorPoolSizing {
    entries: Vec<(vk::DescriptorType, u32)>,
}

impl DescriptorPoolSizing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add capacity for `count` descriptors of `descriptor_type`.
    ///
    /// Repeated types accumulate into one entry.
    pub fn with(mut self, descriptor_type: vk::DescriptorType, count: u32) -> Self {
        match self.entries.iter_mut().find(|(ty, _)| *ty == descriptor_type) {
            Some((_, existing)) => *existing += count,
            None => self.entries.push((descriptor_type, count)),
        }
        self
    }

    pub fn entries(&self) -> &[(vk::DescriptorType, u32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pool size entries in insertion order.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.entries
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect()
    }

    /// Sum of all counts.
    pub fn max_sets(&self) -> u32 {
        self.entries.iter().map(|&(_, count)| count).sum()
    }
}

impl FromIterator<(vk::DescriptorType, u32)> for DescriptorPoolSizing {
    fn from_iter<I: IntoIterator<Item = (vk::DescriptorType, u32)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |sizing, (ty, count)| sizing.with(ty, count))
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Create a pool sized from `sizing`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, sizing: &DescriptorPoolSizing) -> Result<Self> {
        if sizing.is_empty() {
            return Err(GpuError::InvalidState(
                "descriptor pool sizing table is empty".into(),
            ));
        }

        let pool_sizes = sizing.pool_sizes();
        let max_sets = sizing.max_sets();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device
            .create_descriptor_pool(&create_info, None)
            .map_err(GpuError::step("create descriptor pool"))?;
        Ok(Self { pool, max_sets })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Allocate one set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Return sets to the pool.
    ///
    /// # Safety
    /// The sets must come from this pool and not be in use.
    pub unsafe fn free(&self, device: &ash::Device, sets: &[vk::DescriptorSet]) -> Result<()> {
        device.free_descriptor_sets(self.pool, sets)?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a standalone sampler binding.
    pub fn sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::SAMPLER, 1, stage_flags)
    }

    /// Add an array of sampled images indexed dynamically in the shader.
    pub fn sampled_images(self, binding: u32, count: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::SAMPLED_IMAGE, count, stage_flags)
    }

    /// Descriptor counts per type, e.g. to size a pool for this layout.
    pub fn sizing(&self) -> DescriptorPoolSizing {
        self.bindings
            .iter()
            .map(|b| (b.descriptor_type, b.descriptor_count))
            .collect()
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

/// Create a linear-filtered, repeat-addressed sampler.
///
/// # Safety
/// The device must be valid. Anisotropy must have been enabled on it when
/// `max_anisotropy` is given.
pub unsafe fn create_sampler(device: &ash::Device, max_anisotropy: Option<f32>) -> Result<vk::Sampler> {
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(max_anisotropy.is_some())
        .max_anisotropy(max_anisotropy.unwrap_or(1.0))
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .compare_op(vk::CompareOp::ALWAYS)
        .max_lod(0.0);

    Ok(device.create_sampler(&create_info, None)?)
}

/// Write an array of sampled image views starting at element 0.
///
/// # Safety
/// The device and descriptor set must be valid.
pub unsafe fn write_sampled_images(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    views: &[vk::ImageView],
) {
    let image_infos: Vec<_> = views
        .iter()
        .map(|&view| {
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        })
        .collect();

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
        .image_info(&image_infos);

    device.update_descriptor_sets(&[write], &[]);
}

/// Write a standalone sampler.
///
/// # Safety
/// The device and descriptor set must be valid.
pub unsafe fn write_sampler(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    sampler: vk::Sampler,
) {
    let image_info = vk::DescriptorImageInfo::default().sampler(sampler);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_array_pool_holds_nine_sets() {
        let sizing = DescriptorPoolSizing::new()
            .with(vk::DescriptorType::SAMPLED_IMAGE, 8)
            .with(vk::DescriptorType::SAMPLER, 1);

        assert_eq!(sizing.max_sets(), 9);
        let sizes = sizing.pool_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::SAMPLED_IMAGE);
        assert_eq!(sizes[0].descriptor_count, 8);
        assert_eq!(sizes[1].ty, vk::DescriptorType::SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 1);
    }

    #[test]
    fn layout_sizing_fits_in_pool() {
        let pool = DescriptorPoolSizing::new()
            .with(vk::DescriptorType::SAMPLED_IMAGE, 8)
            .with(vk::DescriptorType::SAMPLER, 1);

        let layout = DescriptorSetLayoutBuilder::new()
            .sampler(0, vk::ShaderStageFlags::FRAGMENT)
            .sampled_images(1, 8, vk::ShaderStageFlags::FRAGMENT)
            .sizing();

        for &(ty, needed) in layout.entries() {
            let available = pool
                .entries()
                .iter()
                .find(|(pool_ty, _)| *pool_ty == ty)
                .map_or(0, |&(_, count)| count);
            assert!(needed <= available, "{ty:?}: {needed} > {available}");
        }
    }

    #[test]
    fn repeated_types_accumulate() {
        let sizing: DescriptorPoolSizing = [
            (vk::DescriptorType::UNIFORM_BUFFER, 2),
            (vk::DescriptorType::SAMPLER, 1),
            (vk::DescriptorType::UNIFORM_BUFFER, 3),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            sizing.entries(),
            &[
                (vk::DescriptorType::UNIFORM_BUFFER, 5),
                (vk::DescriptorType::SAMPLER, 1)
            ]
        );
        assert_eq!(sizing.max_sets(), 6);
    }
}
