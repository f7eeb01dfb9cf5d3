// Mesh data and GPU buffers
//
// A model is loaded from an OBJ file into CPU-side vertex/index vectors,
// uploaded once with build_buffers, then drawn every frame. Faces are
// triangulated and expanded to one vertex per face index, so the index
// buffer is the sequence 0..n.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::backend::{Buffer, VulkanContext};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec3,
    pub tex: Vec2,
}

struct ModelBuffers {
    vertex: Buffer,
    index: Buffer,
}

#[derive(Default)]
pub struct Model {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    buffers: Option<ModelBuffers>,
}

impl Model {
    pub fn from_obj(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open model file {:?}", path))?;
        let mut reader = std::io::BufReader::new(file);
        Self::from_obj_reader(&mut reader)
            .with_context(|| format!("Failed to load model {:?}", path))
    }

    fn from_obj_reader(reader: &mut impl BufRead) -> Result<Self> {
        let (meshes, _materials) = tobj::load_obj_buf(
            reader,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
            // Materials are not used; swallow any mtllib reference
            |_| Ok((Vec::new(), Default::default())),
        )?;

        let mut model = Self::default();

        for mesh in &meshes {
            let mesh = &mesh.mesh;
            for &index in &mesh.indices {
                let i = index as usize;
                let pos = Vec3::new(
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                );
                // OBJ texture space is bottom-up
                let tex = if mesh.texcoords.is_empty() {
                    Vec2::ZERO
                } else {
                    Vec2::new(mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1])
                };

                model.indices.push(model.indices.len() as u32);
                model.vertices.push(Vertex { pos, tex });
            }
        }

        anyhow::ensure!(!model.vertices.is_empty(), "Model contains no geometry");
        Ok(model)
    }

    /// Upload the vertex and index data; the model is immutable afterwards.
    pub fn build_buffers(&mut self, ctx: &Arc<VulkanContext>) -> Result<()> {
        let index = Buffer::from_data(
            ctx,
            "model indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            &self.indices,
        )?;
        let vertex = Buffer::from_data(
            ctx,
            "model vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &self.vertices,
        )?;

        self.buffers = Some(ModelBuffers { vertex, index });
        Ok(())
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Record one indexed draw of the whole mesh.
    pub fn record_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        debug_assert!(self.buffers.is_some(), "draw before build_buffers");
        let Some(buffers) = &self.buffers else {
            return;
        };

        unsafe {
            device.cmd_bind_index_buffer(cmd, buffers.index.handle(), 0, vk::IndexType::UINT32);
            device.cmd_bind_vertex_buffers(cmd, 0, &[buffers.vertex.handle()], &[0]);
            device.cmd_draw_indexed(cmd, self.index_count(), 1, 0, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One quad with texcoords; triangulation yields two triangles
    const QUAD_OBJ: &[u8] = b"\
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 1.0 1.0 0.0
v 0.0 1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3 4/4
";

    fn load_quad() -> Model {
        Model::from_obj_reader(&mut &QUAD_OBJ[..]).unwrap()
    }

    #[test]
    fn ingestion_produces_sequential_indices() {
        let model = load_quad();
        assert_eq!(model.indices.len(), 6);
        let expected: Vec<u32> = (0..6).collect();
        assert_eq!(model.indices, expected);
    }

    #[test]
    fn index_buffer_matches_vertex_expansion() {
        let model = load_quad();
        assert_eq!(model.vertices.len(), model.indices.len());
        assert_eq!(model.index_count() as usize, model.indices.len());
    }

    #[test]
    fn texcoords_are_vertically_flipped() {
        let model = load_quad();
        let origin_corner = model
            .vertices
            .iter()
            .find(|v| v.pos == Vec3::ZERO)
            .expect("quad corner at the origin");
        assert_eq!(origin_corner.tex, Vec2::new(0.0, 1.0));
    }

    #[test]
    fn empty_obj_is_rejected() {
        assert!(Model::from_obj_reader(&mut &b"# nothing here\n"[..]).is_err());
    }

    #[test]
    fn missing_texcoords_default_to_zero() {
        let obj = b"\
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 0.0 1.0 0.0
f 1 2 3
";
        let model = Model::from_obj_reader(&mut &obj[..]).unwrap();
        assert_eq!(model.vertices.len(), 3);
        assert!(model.vertices.iter().all(|v| v.tex == Vec2::ZERO));
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
    }
}
