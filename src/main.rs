use erupt::vk;
use glam::{vec3, Mat4, Quat, Vec3};
use raytrace_accel::scene::{MaterialWorkflow, MeshGeometry, Scene, SceneInstance};
use raytrace_accel::vulkan::buffer::Buffer;
use raytrace_accel::vulkan::device::Device;
use raytrace_accel::vulkan::raytracing::{RaytracingCoordinator, RaytracingDevice};
use raytrace_accel::{RaytracingConfig, Result};
use std::rc::Rc;

const FRAMES: u32 = 8;
const GRID_SIZE: u32 = 64;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .ok();
    puffin::set_scopes_on(true);

    if let Err(err) = run() {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => RaytracingConfig::from_file(path)?,
        None => RaytracingConfig::default(),
    };
    log::info!("{:?}", config);

    let device = Rc::new(Device::new()?);
    let mut mesh_buffers = Vec::new();
    let result = run_scene(&device, config, &mut mesh_buffers);

    device.wait_idle();
    for buffer in mesh_buffers {
        device.destroy_buffer(buffer);
    }
    result
}

fn run_scene(
    device: &Rc<Device>,
    config: RaytracingConfig,
    mesh_buffers: &mut Vec<Buffer>,
) -> Result<()> {
    let mut scene = Scene::new();
    let (positions, indices) = cube();
    let cube = scene.add_mesh(upload_mesh(&**device, &positions, &indices, mesh_buffers)?);
    let (positions, indices) = grid(GRID_SIZE);
    let ground = scene.add_mesh(upload_mesh(&**device, &positions, &indices, mesh_buffers)?);

    scene.add_instance(SceneInstance::new(
        Mat4::from_scale(vec3(20.0, 1.0, 20.0)),
        ground,
        MaterialWorkflow::Lambertian,
    ));
    for i in 0..16 {
        let workflow = if i % 3 == 0 {
            MaterialWorkflow::Lambertian
        } else {
            MaterialWorkflow::Pbr
        };
        scene.add_instance(SceneInstance::new(
            cube_transform(i, 0.0),
            cube,
            workflow,
        ));
    }

    let mut coordinator = RaytracingCoordinator::new(Rc::clone(device), config);
    let result = animate(&mut coordinator, &mut scene);
    coordinator.destroy();
    result
}

fn animate(coordinator: &mut RaytracingCoordinator<Device>, scene: &mut Scene) -> Result<()> {
    coordinator.load_scene(scene)?;
    log::info!(
        "scene loaded: {} BLAS, TLAS {:?}",
        coordinator.blas().len(),
        coordinator.tlas()
    );

    for frame in 1..=FRAMES {
        puffin::GlobalProfiler::lock().new_frame();
        puffin::profile_scope!("frame");
        let time = frame as f32 / 10.0;
        for (i, instance) in scene.instances_mut().iter_mut().skip(1).enumerate() {
            instance.transform = cube_transform(i as u32, time);
        }
        let submitted = coordinator.update_instances(scene)?;
        log::info!("frame {}: TLAS {}", frame, if submitted { "refit" } else { "unchanged" });
    }

    log::info!("{}", coordinator.stats());
    Ok(())
}

fn cube_transform(i: u32, time: f32) -> Mat4 {
    let x = (i % 4) as f32 * 3.0 - 4.5;
    let z = (i / 4) as f32 * 3.0 - 4.5;
    Mat4::from_rotation_translation(
        Quat::from_rotation_y(time * (i + 1) as f32),
        vec3(x, 1.0 + (time + i as f32).sin() * 0.5, z),
    )
}

fn upload_mesh(
    device: &Device,
    positions: &[[f32; 3]],
    indices: &[u32],
    mesh_buffers: &mut Vec<Buffer>,
) -> Result<MeshGeometry> {
    let usage = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    let memory_usage = gpu_alloc::UsageFlags::HOST_ACCESS
        | gpu_alloc::UsageFlags::UPLOAD
        | gpu_alloc::UsageFlags::DEVICE_ADDRESS;

    let vertex_bytes: &[u8] = bytemuck::cast_slice(positions);
    let mut vertex_buffer = device.create_buffer(vertex_bytes.len() as u64, usage, memory_usage)?;
    device.write_buffer(&mut vertex_buffer, vertex_bytes)?;
    let vertex_address = vertex_buffer.get_device_address();
    mesh_buffers.push(vertex_buffer);

    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let mut index_buffer = device.create_buffer(index_bytes.len() as u64, usage, memory_usage)?;
    device.write_buffer(&mut index_buffer, index_bytes)?;
    let index_address = index_buffer.get_device_address();
    mesh_buffers.push(index_buffer);

    Ok(MeshGeometry {
        vertex_address,
        index_address,
        vertex_count: positions.len() as u32,
        index_count: indices.len() as u32,
        vertex_stride: std::mem::size_of::<[f32; 3]>() as u64,
    })
}

fn cube() -> (Vec<[f32; 3]>, Vec<u32>) {
    let positions = (0..8)
        .map(|corner| {
            vec3(
                if corner & 1 == 0 { -0.5 } else { 0.5 },
                if corner & 2 == 0 { -0.5 } else { 0.5 },
                if corner & 4 == 0 { -0.5 } else { 0.5 },
            )
            .to_array()
        })
        .collect();
    let indices = vec![
        0, 2, 1, 1, 2, 3, // -z
        4, 5, 6, 5, 7, 6, // +z
        0, 1, 4, 1, 5, 4, // -y
        2, 6, 3, 3, 6, 7, // +y
        0, 4, 2, 2, 4, 6, // -x
        1, 3, 5, 3, 7, 5, // +x
    ];
    (positions, indices)
}

/// Unit square in the xz plane split into `size * size` quads.
fn grid(size: u32) -> (Vec<[f32; 3]>, Vec<u32>) {
    let step = 1.0 / size as f32;
    let positions = (0..=size)
        .flat_map(|z| {
            (0..=size).map(move |x| {
                (Vec3::new(x as f32 * step, 0.0, z as f32 * step) - vec3(0.5, 0.0, 0.5)).to_array()
            })
        })
        .collect();
    let row = size + 1;
    let indices = (0..size)
        .flat_map(|z| {
            (0..size).flat_map(move |x| {
                let i = z * row + x;
                [i, i + row, i + 1, i + 1, i + row, i + row + 1]
            })
        })
        .collect();
    (positions, indices)
}
