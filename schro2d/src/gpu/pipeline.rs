//! The compute pipeline and its prebuilt binding sets.
//!
//! The set layout, descriptor pool and every binding set are derived from
//! [`FIELD_BINDINGS`]. One set exists per `(image, parity)` pair and all of
//! them are written once at startup; nothing is rebound while frames run.

use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use ash::vk;
use tracing::{debug, instrument};

use crate::{
    binding::{BindingKind, BindingSetKey, FIELD_BINDINGS, ResolvedResource, descriptors_of_kind},
    error::{EngineError, EngineResult, VkResultExt},
    gpu::{state::StateStore, surface::PresentableImage},
    plan::StepParameters,
    teardown::OwnershipList,
};

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Compute pipeline plus everything needed to bind it.
pub struct ComputePipeline {
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    sets: Vec<vk::DescriptorSet>,
}

impl ComputePipeline {
    /// Loads the device program and builds the pipeline and binding sets.
    #[instrument(level = "info", skip(device, images, state, owned))]
    pub fn create(
        device: &ash::Device,
        program: &Path,
        images: &[PresentableImage],
        state: &StateStore,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self> {
        let code = load_program(program)?;
        let module_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe {
            device
                .create_shader_module(&module_info, None)
                .during("vkCreateShaderModule")?
        };
        let destroy = device.clone();
        owned.adopt("shader module", module, move |module| unsafe {
            destroy.destroy_shader_module(module, None);
        });

        let bindings = layout_bindings();
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&set_layout_info, None)
                .during("vkCreateDescriptorSetLayout")?
        };
        let destroy = device.clone();
        owned.adopt("set layout", set_layout, move |layout| unsafe {
            destroy.destroy_descriptor_set_layout(layout, None);
        });

        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(StepParameters::SIZE)];
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        let layout = unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .during("vkCreatePipelineLayout")?
        };
        let destroy = device.clone();
        owned.adopt("pipeline layout", layout, move |layout| unsafe {
            destroy.destroy_pipeline_layout(layout, None);
        });

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT);
        let pipeline_info = [vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout)];
        let pipeline = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &pipeline_info, None)
                .map_err(|(_, result)| result)
                .during("vkCreateComputePipelines")?
        };
        let pipeline = pipeline.first().copied().ok_or(EngineError::Vulkan {
            call: "vkCreateComputePipelines",
            result: vk::Result::ERROR_UNKNOWN,
        })?;
        let destroy = device.clone();
        owned.adopt("pipeline", pipeline, move |pipeline| unsafe {
            destroy.destroy_pipeline(pipeline, None);
        });

        let set_count = BindingSetKey::set_count(images.len() as u32);
        let sizes = pool_sizes(set_count);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(set_count)
            .pool_sizes(&sizes);
        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .during("vkCreateDescriptorPool")?
        };
        let destroy = device.clone();
        owned.adopt("descriptor pool", pool, move |pool| unsafe {
            destroy.destroy_descriptor_pool(pool, None);
        });

        let layouts = vec![set_layout; set_count as usize];
        let allocate = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            device
                .allocate_descriptor_sets(&allocate)
                .during("vkAllocateDescriptorSets")?
        };
        for key in BindingSetKey::all(images.len() as u32) {
            write_set(device, sets[key.index()], key, images, state)?;
        }
        debug!(sets = sets.len(), "binding sets written");

        Ok(Self {
            layout,
            pipeline,
            sets,
        })
    }

    /// The pipeline handle.
    #[must_use]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// The pipeline layout.
    #[must_use]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The prebuilt set for `key`.
    pub fn set(&self, key: BindingSetKey) -> EngineResult<vk::DescriptorSet> {
        self.sets.get(key.index()).copied().ok_or_else(|| {
            EngineError::Config(format!("no binding set for image {}", key.image))
        })
    }
}

/// Reads a SPIR-V program from disk.
pub fn load_program(path: &Path) -> EngineResult<Vec<u32>> {
    let bytes = fs::read(path).map_err(|source| EngineError::ProgramRead {
        path: PathBuf::from(path),
        source,
    })?;
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|source| EngineError::ProgramInvalid {
        path: PathBuf::from(path),
        source,
    })
}

/// Set layout bindings for [`FIELD_BINDINGS`].
#[must_use]
pub fn layout_bindings() -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    FIELD_BINDINGS
        .iter()
        .map(|slot| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(slot.binding)
                .descriptor_type(slot.resource.kind().descriptor_type())
                .descriptor_count(1)
                .stage_flags(slot.stage)
        })
        .collect()
}

/// Pool sizes for `sets` binding sets.
#[must_use]
pub fn pool_sizes(sets: u32) -> Vec<vk::DescriptorPoolSize> {
    [BindingKind::StorageImage, BindingKind::StorageBuffer]
        .into_iter()
        .map(|kind| vk::DescriptorPoolSize {
            ty: kind.descriptor_type(),
            descriptor_count: descriptors_of_kind(kind, sets),
        })
        .filter(|size| size.descriptor_count > 0)
        .collect()
}

fn write_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    key: BindingSetKey,
    images: &[PresentableImage],
    state: &StateStore,
) -> EngineResult<()> {
    for slot in &FIELD_BINDINGS {
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(slot.binding)
            .descriptor_type(slot.resource.kind().descriptor_type());
        match slot.resolve(key) {
            ResolvedResource::Image(index) => {
                let image = images.get(index as usize).ok_or_else(|| {
                    EngineError::Config(format!("no presentable image {index}"))
                })?;
                let info = [vk::DescriptorImageInfo::default()
                    .image_view(image.view)
                    .image_layout(vk::ImageLayout::GENERAL)];
                unsafe { device.update_descriptor_sets(&[write.image_info(&info)], &[]) };
            }
            resource => {
                let buffer = state.buffer_for(resource).ok_or_else(|| {
                    EngineError::Config(format!("{resource:?} is not a buffer"))
                })?;
                let info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer.handle())
                    .offset(0)
                    .range(vk::WHOLE_SIZE)];
                unsafe { device.update_descriptor_sets(&[write.buffer_info(&info)], &[]) };
            }
        }
    }
    Ok(())
}
