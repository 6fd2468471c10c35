//! Declarative resource bindings for the device program.
//!
//! The device program declares five parameter slots. Instead of wiring each
//! binding set by hand, [`FIELD_BINDINGS`] lists every slot once and the
//! backend applies it uniformly to each set. A set is identified by a
//! [`BindingSetKey`]: the presentable image it writes to plus the ping-pong
//! parity of the step it advances.
//!
//! # Ping-pong
//!
//! At logical step `k` the dispatch reads [`FieldBuffer`] `k mod 2` and writes
//! `(k + 1) mod 2`. The parity comes from the step counter, never from the
//! image index: the surface is free to hand out images in any order, and
//! tying the parity to the image would break the alternation whenever it
//! does.

use ash::vk;

/// One of the two field buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldBuffer {
    /// Buffer 0.
    Ping,
    /// Buffer 1.
    Pong,
}

impl FieldBuffer {
    /// Buffers read and written at logical step `step`, as `(read, write)`.
    #[must_use]
    pub const fn for_step(step: u64) -> (Self, Self) {
        if step % 2 == 0 {
            (Self::Ping, Self::Pong)
        } else {
            (Self::Pong, Self::Ping)
        }
    }

    /// The buffer holding the latest state after `completed` steps.
    #[must_use]
    pub const fn latest_after(completed: u64) -> Self {
        if completed % 2 == 0 { Self::Ping } else { Self::Pong }
    }

    /// The other buffer of the pair.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Ping => Self::Pong,
            Self::Pong => Self::Ping,
        }
    }

    /// Position of the buffer in the pair.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Ping => 0,
            Self::Pong => 1,
        }
    }
}

/// Which resource a binding slot refers to, relative to a binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    /// The presentable image the program visualizes into.
    TargetImage,
    /// The field read by this step.
    CurrentField,
    /// The field written by this step.
    NextField,
    /// The static potential.
    Potential,
    /// Intermediate storage shared by the sub-stages.
    Scratch,
}

/// Descriptor category of a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// A storage image in `GENERAL` layout.
    StorageImage,
    /// A storage buffer bound whole.
    StorageBuffer,
}

impl BindingKind {
    /// The Vulkan descriptor type for this kind.
    #[must_use]
    pub const fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

impl BindingResource {
    /// Descriptor category the resource is bound as.
    #[must_use]
    pub const fn kind(self) -> BindingKind {
        match self {
            Self::TargetImage => BindingKind::StorageImage,
            _ => BindingKind::StorageBuffer,
        }
    }
}

/// One `(slot, resource, stage)` entry of the binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    /// Binding number declared by the device program.
    pub binding: u32,
    /// Resource placed in the slot.
    pub resource: BindingResource,
    /// Shader stages that read the slot.
    pub stage: vk::ShaderStageFlags,
}

/// The binding layout the device program expects.
pub const FIELD_BINDINGS: [BindingSlot; 5] = [
    BindingSlot {
        binding: 0,
        resource: BindingResource::TargetImage,
        stage: vk::ShaderStageFlags::COMPUTE,
    },
    BindingSlot {
        binding: 1,
        resource: BindingResource::CurrentField,
        stage: vk::ShaderStageFlags::COMPUTE,
    },
    BindingSlot {
        binding: 2,
        resource: BindingResource::NextField,
        stage: vk::ShaderStageFlags::COMPUTE,
    },
    BindingSlot {
        binding: 3,
        resource: BindingResource::Potential,
        stage: vk::ShaderStageFlags::COMPUTE,
    },
    BindingSlot {
        binding: 4,
        resource: BindingResource::Scratch,
        stage: vk::ShaderStageFlags::COMPUTE,
    },
];

/// Identifies one prebuilt binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSetKey {
    /// Presentable image written by the set.
    pub image: u32,
    /// Field buffer read by the set.
    pub parity: FieldBuffer,
}

impl BindingSetKey {
    /// The set to bind when `image` was acquired for logical step `step`.
    #[must_use]
    pub const fn for_frame(image: u32, step: u64) -> Self {
        Self {
            image,
            parity: FieldBuffer::for_step(step).0,
        }
    }

    /// Number of sets needed for `images` presentable images.
    #[must_use]
    pub const fn set_count(images: u32) -> u32 {
        images * 2
    }

    /// Position of the set in the flat allocation order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.image as usize * 2 + self.parity.index()
    }

    /// All keys for `images` presentable images, in allocation order.
    pub fn all(images: u32) -> impl Iterator<Item = Self> {
        (0..images).flat_map(|image| {
            [FieldBuffer::Ping, FieldBuffer::Pong]
                .into_iter()
                .map(move |parity| Self { image, parity })
        })
    }
}

/// A binding slot resolved against a concrete set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedResource {
    /// Presentable image by index.
    Image(u32),
    /// One of the field buffers.
    Field(FieldBuffer),
    /// The potential buffer.
    Potential,
    /// The scratch buffer.
    Scratch,
}

impl BindingSlot {
    /// The concrete resource this slot holds in the set `key`.
    #[must_use]
    pub const fn resolve(&self, key: BindingSetKey) -> ResolvedResource {
        match self.resource {
            BindingResource::TargetImage => ResolvedResource::Image(key.image),
            BindingResource::CurrentField => ResolvedResource::Field(key.parity),
            BindingResource::NextField => ResolvedResource::Field(key.parity.other()),
            BindingResource::Potential => ResolvedResource::Potential,
            BindingResource::Scratch => ResolvedResource::Scratch,
        }
    }
}

/// Number of descriptors of `kind` needed for `sets` binding sets.
#[must_use]
pub fn descriptors_of_kind(kind: BindingKind, sets: u32) -> u32 {
    let per_set = FIELD_BINDINGS
        .iter()
        .filter(|slot| slot.resource.kind() == kind)
        .count() as u32;
    per_set * sets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_parity_alternates() {
        for step in 0..8u64 {
            let (read, write) = FieldBuffer::for_step(step);
            assert_eq!(read.index() as u64, step % 2);
            assert_eq!(write.index() as u64, (step + 1) % 2);
            assert_eq!(FieldBuffer::latest_after(step + 1), write);
        }
        assert_eq!(FieldBuffer::latest_after(0), FieldBuffer::Ping);
    }

    #[test]
    fn table_slots_are_unique_and_dense() {
        for (expected, slot) in FIELD_BINDINGS.iter().enumerate() {
            assert_eq!(slot.binding as usize, expected);
        }
        assert_eq!(descriptors_of_kind(BindingKind::StorageImage, 6), 6);
        assert_eq!(descriptors_of_kind(BindingKind::StorageBuffer, 6), 24);
    }

    #[test]
    fn sets_resolve_to_the_acquired_image_and_step_parity() {
        let key = BindingSetKey::for_frame(2, 5);
        assert_eq!(key.parity, FieldBuffer::Pong);
        let resolved: Vec<_> = FIELD_BINDINGS.iter().map(|s| s.resolve(key)).collect();
        assert_eq!(
            resolved,
            [
                ResolvedResource::Image(2),
                ResolvedResource::Field(FieldBuffer::Pong),
                ResolvedResource::Field(FieldBuffer::Ping),
                ResolvedResource::Potential,
                ResolvedResource::Scratch,
            ]
        );
    }

    #[test]
    fn key_indices_match_allocation_order() {
        let keys: Vec<_> = BindingSetKey::all(3).collect();
        assert_eq!(keys.len() as u32, BindingSetKey::set_count(3));
        for (position, key) in keys.iter().enumerate() {
            assert_eq!(key.index(), position);
        }
    }
}
