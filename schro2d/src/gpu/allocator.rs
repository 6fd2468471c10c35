//! Host-visible buffer allocation.
//!
//! All buffers the engine uses are small enough to live in host-visible,
//! coherent memory and stay persistently mapped. Memory comes from a
//! [`gpu_allocator`] sub-allocator, which is itself released before the
//! device.

use std::{cell::RefCell, ptr, ptr::NonNull, rc::Rc};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::{
    MemoryLocation,
    vulkan::{self, AllocationCreateDesc, AllocationScheme, AllocatorCreateDesc},
};
use tracing::{debug, warn};

use crate::{
    error::{EngineError, EngineResult, VkResultExt},
    teardown::OwnershipList,
};

type Shared = Rc<RefCell<Option<vulkan::Allocator>>>;

/// A persistently mapped device buffer.
#[derive(Debug)]
pub struct HostBuffer {
    buffer: vk::Buffer,
    mapped: NonNull<u8>,
    size: u64,
}

impl HostBuffer {
    /// The buffer handle.
    #[must_use]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Creates buffers and moves data between them and the host.
pub struct Allocator {
    device: ash::Device,
    inner: Shared,
}

impl Allocator {
    /// Creates the sub-allocator for `device` and registers its release.
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self> {
        let allocator = vulkan::Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        let inner: Shared = Rc::new(RefCell::new(Some(allocator)));
        let release = Rc::clone(&inner);
        owned.defer("allocator", move || drop(release.borrow_mut().take()));
        Ok(Self {
            device: device.clone(),
            inner,
        })
    }

    /// Creates a mapped buffer of `size` bytes.
    pub fn create_buffer(
        &self,
        label: &'static str,
        size: u64,
        usage: vk::BufferUsageFlags,
        owned: &mut OwnershipList,
    ) -> EngineResult<HostBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&info, None)
                .during("vkCreateBuffer")?
        };
        let destroy = self.device.clone();
        owned.adopt(label, buffer, move |buffer| unsafe {
            destroy.destroy_buffer(buffer, None);
        });

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self
            .inner
            .borrow_mut()
            .as_mut()
            .ok_or_else(|| EngineError::Config("allocator already released".into()))?
            .allocate(&buffer_allocation(label, requirements))?;

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .during("vkBindBufferMemory")
        };
        let mapped = allocation.mapped_ptr().map(NonNull::cast::<u8>);
        let memory_offset = allocation.offset();

        let allocator = Rc::clone(&self.inner);
        owned.defer(label, move || {
            if let Some(allocator) = allocator.borrow_mut().as_mut()
                && let Err(err) = allocator.free(allocation)
            {
                warn!(object = label, "failed to free allocation: {err}");
            }
        });
        bound?;
        let mapped = mapped.ok_or(EngineError::Vulkan {
            call: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        })?;
        debug!(label, size, offset = memory_offset, "buffer created");

        Ok(HostBuffer {
            buffer,
            mapped,
            size,
        })
    }

    /// Copies `data` to the start of `buffer`.
    pub fn write<T: Pod>(&self, buffer: &HostBuffer, data: &[T]) -> EngineResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        check_fits(buffer.size, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.mapped.as_ptr(), bytes.len());
        }
        Ok(())
    }

    /// Copies `count` elements from the start of `buffer`.
    pub fn read<T: Pod>(&self, buffer: &HostBuffer, count: usize) -> EngineResult<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        check_fits(buffer.size, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(buffer.mapped.as_ptr(), bytes.as_mut_ptr(), bytes.len());
        }
        Ok(out)
    }
}

/// Allocation request for one storage buffer: linear, mapped, coherent.
fn buffer_allocation(
    name: &'static str,
    requirements: vk::MemoryRequirements,
) -> AllocationCreateDesc<'static> {
    AllocationCreateDesc {
        name,
        requirements,
        location: MemoryLocation::CpuToGpu,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }
}

fn check_fits(size: u64, len: usize) -> EngineResult<()> {
    if len as u64 > size {
        return Err(EngineError::Config(format!(
            "{len} bytes do not fit a {size} byte buffer"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_linear_and_host_mapped() {
        let requirements = vk::MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: 0b1010,
        };
        let desc = buffer_allocation("field ping", requirements);
        assert_eq!(desc.name, "field ping");
        assert!(desc.linear);
        assert_eq!(desc.location, MemoryLocation::CpuToGpu);
        assert_eq!(desc.requirements.size, 4096);
        assert_eq!(desc.requirements.memory_type_bits, 0b1010);
    }

    #[test]
    fn copies_must_fit_the_buffer() {
        assert!(check_fits(64, 64).is_ok());
        assert!(check_fits(64, 0).is_ok());
        let err = check_fits(32, 64).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: 64 bytes do not fit a 32 byte buffer"
        );
    }
}
