//! Device-side simulation state: two field buffers, the potential and scratch.

use ash::vk;
use tracing::instrument;

use crate::{
    binding::{FieldBuffer, ResolvedResource},
    error::{EngineError, EngineResult},
    field::{Amplitude, Grid, InitialState},
    gpu::allocator::{Allocator, HostBuffer},
    teardown::OwnershipList,
};

/// The buffers the device program reads and writes.
pub struct StateStore {
    grid: Grid,
    fields: [HostBuffer; 2],
    potential: HostBuffer,
    scratch: HostBuffer,
}

impl StateStore {
    /// Allocates buffers sized for `grid`.
    #[instrument(level = "info", skip(allocator, owned))]
    pub fn create(
        allocator: &Allocator,
        grid: Grid,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let ping = allocator.create_buffer("field ping", grid.field_bytes(), usage, owned)?;
        let pong = allocator.create_buffer("field pong", grid.field_bytes(), usage, owned)?;
        let potential =
            allocator.create_buffer("potential", grid.potential_bytes(), usage, owned)?;
        let scratch = allocator.create_buffer("scratch", grid.field_bytes(), usage, owned)?;
        Ok(Self {
            grid,
            fields: [ping, pong],
            potential,
            scratch,
        })
    }

    /// Writes the initial field into both field buffers, and the potential.
    ///
    /// Must not be called while device work is in flight.
    pub fn upload(&self, allocator: &Allocator, initial: &InitialState) -> EngineResult<()> {
        if initial.grid() != self.grid {
            return Err(EngineError::GridMismatch {
                what: "initial field",
                actual: initial.grid().cells(),
                expected: self.grid.cells(),
                width: self.grid.width,
                height: self.grid.height,
            });
        }
        for field in &self.fields {
            allocator.write(field, initial.field())?;
        }
        allocator.write(&self.potential, &initial.device_potential())
    }

    /// Copies one field buffer to the host. The caller makes sure the writing
    /// submission has completed.
    pub fn read_field(
        &self,
        allocator: &Allocator,
        buffer: FieldBuffer,
    ) -> EngineResult<Vec<Amplitude>> {
        allocator.read(&self.fields[buffer.index()], self.grid.cells())
    }

    /// The buffer behind a resolved binding, if it is a buffer.
    #[must_use]
    pub fn buffer_for(&self, resource: ResolvedResource) -> Option<&HostBuffer> {
        match resource {
            ResolvedResource::Field(buffer) => Some(&self.fields[buffer.index()]),
            ResolvedResource::Potential => Some(&self.potential),
            ResolvedResource::Scratch => Some(&self.scratch),
            ResolvedResource::Image(_) => None,
        }
    }
}
