//! Progressive tracer CLI: headless convergence runs and the interactive viewer.

use std::env;
use std::process::ExitCode;

use rand::rngs::StdRng;
use rand::SeedableRng;

use progressive_tracer::camera::CameraState;
use progressive_tracer::gpu::HeadlessBackend;
use progressive_tracer::render_loop::{FrameInput, RenderLoop};
use progressive_tracer::scene::generate::demo_scene;
use progressive_tracer::settings::Settings;

/// Options shared by every command.
struct Options {
    frames: u32,
    width: u32,
    height: u32,
    seed: Option<u64>,
    spheres: Option<u32>,
    skybox: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            frames: 32,
            width: 160,
            height: 90,
            seed: None,
            spheres: None,
            skybox: None,
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let prog = args.first().map(String::as_str).unwrap_or("progressive-tracer");

    // Logging level comes from the flags unless PT_LOG is set.
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => set_default_log("debug"),
            "-vv" | "--trace" => set_default_log("trace"),
            "-q" | "--quiet" => set_default_log("warn"),
            _ => filtered_args.push(arg),
        }
    }

    let Some((&command, rest)) = filtered_args.split_first() else {
        print_usage(prog);
        return ExitCode::SUCCESS;
    };

    let options = match parse_options(rest) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{msg}");
            print_usage(prog);
            return ExitCode::FAILURE;
        }
    };

    match command {
        "headless" | "r" => cmd_headless(&options),
        "view" | "v" => cmd_view(options),
        "version" | "-V" | "--version" => {
            println!("progressive-tracer {}", version_string());
            ExitCode::SUCCESS
        }
        "help" | "h" | "-h" | "--help" => {
            print_usage(prog);
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {command}");
            print_usage(prog);
            ExitCode::FAILURE
        }
    }
}

fn set_default_log(level: &str) {
    if env::var_os("PT_LOG").is_none() {
        env::set_var("PT_LOG", level);
    }
}

fn parse_options(args: &[&str]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        let mut value = || iter.next().copied().ok_or_else(|| format!("{arg} needs a value"));
        match arg {
            "--frames" | "-n" => options.frames = parse_num(arg, value()?)?,
            "--seed" => options.seed = Some(parse_num(arg, value()?)?),
            "--spheres" => options.spheres = Some(parse_num(arg, value()?)?),
            "--skybox" => options.skybox = Some(value()?.to_string()),
            "--size" => {
                let size = value()?;
                let (w, h) = size
                    .split_once('x')
                    .ok_or_else(|| format!("--size expects WIDTHxHEIGHT, got {size}"))?;
                options.width = parse_num(arg, w)?;
                options.height = parse_num(arg, h)?;
            }
            _ => return Err(format!("Unknown option: {arg}")),
        }
    }
    Ok(options)
}

fn parse_num<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value.parse().map_err(|_| format!("{flag}: not a number: {value}"))
}

/// Version line with the build stamp from `build.rs`.
fn version_string() -> String {
    let date = option_env!("PT_BUILD_DATE").unwrap_or("unknown");
    let time = option_env!("PT_BUILD_TIME").unwrap_or("unknown");
    format!("{} (built {} {})", env!("CARGO_PKG_VERSION"), date, time)
}

fn print_usage(prog: &str) {
    println!("Progressive Tracer {} - progressive path tracing with scene-to-GPU sync", version_string());
    println!();
    println!("Usage: {} [options] <command> [command options]", prog);
    println!();
    println!("Commands:");
    println!("  r, headless  Render frames of the demo scene on the host and report convergence");
    println!("  v, view      Open the interactive viewer (needs the `viewer` feature)");
    println!("  h, help      Show this help");
    println!();
    println!("Command options:");
    println!("  -n, --frames N     Frames to accumulate (headless, default 32)");
    println!("  --size WxH         Render size (headless, default 160x90)");
    println!("  --seed S           Fixed seed for scene generation and jitter");
    println!("  --spheres N        Number of sphere placement attempts");
    println!("  --skybox FILE      Equirectangular .hdr/.exr environment (viewer)");
    println!();
    println!("Options:");
    println!("  -v, --verbose  Debug output");
    println!("  -vv, --trace   Trace output (very verbose)");
    println!("  -q, --quiet    Warnings only");
    println!();
    println!("Environment: PT_LOG=<filter> overrides the log filter, PT_TRACE=1 writes trace.json");
}

fn load_settings(options: &Options) -> Settings {
    let mut settings = Settings::load();
    if options.seed.is_some() {
        settings.render.seed = options.seed;
    }
    if let Some(spheres) = options.spheres {
        settings.scene.num_spheres = spheres;
    }
    settings
}

fn cmd_headless(options: &Options) -> ExitCode {
    let _guard = progressive_tracer::init_tracing();
    let settings = load_settings(options);

    let mut scene_rng = match settings.render.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut tracer = RenderLoop::new(HeadlessBackend::new(), settings.render.clone());
    for object in demo_scene(&mut scene_rng, &settings.scene) {
        tracer.registry_mut().register(object);
    }

    let aspect = options.width as f32 / options.height.max(1) as f32;
    let camera = CameraState::orbit(
        glam::Vec3::ZERO,
        settings.camera_distance,
        settings.camera_yaw,
        settings.camera_pitch,
        aspect,
    );
    let input = FrameInput::new(options.width, options.height, camera);

    tracing::info!(
        objects = tracer.registry().len(),
        width = options.width,
        height = options.height,
        frames = options.frames,
        "headless render"
    );

    let started = std::time::Instant::now();
    let mut previous: Option<glam::Vec3> = None;
    for _ in 0..options.frames {
        let outcome = tracer.run_frame(&input);
        let Some(targets) = tracer.accumulator().targets() else {
            tracing::warn!(?outcome, "no accumulation targets");
            continue;
        };
        let Some(mean) = tracer.backend().image_mean(targets.converged) else {
            continue;
        };
        let delta = previous.map_or(f32::NAN, |p| (mean - p).abs().max_element());
        tracing::info!(
            samples = tracer.sample_count(),
            mean_r = mean.x,
            mean_g = mean.y,
            mean_b = mean.z,
            delta,
            "frame"
        );
        previous = Some(mean);
    }

    let flat = tracer.snapshot();
    let stats = tracer.backend().stats();
    println!("Scene:");
    println!("  Vertices:  {}", flat.vertices.len());
    println!("  Indices:   {}", flat.indices.len());
    println!("  Meshes:    {}", flat.mesh_descriptors.len());
    println!("  Spheres:   {}", flat.sphere_descriptors.len());
    let bounds = flat.bounds();
    if !bounds.is_empty() {
        let c = bounds.center();
        println!("  Bounds:    center ({:.1}, {:.1}, {:.1}) radius {:.1}", c.x, c.y, c.z, bounds.radius());
    }
    println!("Device:");
    println!("  Buffer allocations: {}", stats.buffer_allocations);
    println!("  Buffer uploads:     {}", stats.buffer_uploads);
    println!("  Dispatches:         {}", stats.dispatches);
    println!("Result:");
    println!("  Samples:   {}", tracer.sample_count());
    if let Some(mean) = previous {
        println!("  Mean RGB:  {:.4} {:.4} {:.4}", mean.x, mean.y, mean.z);
    }
    println!("  Elapsed:   {:.2?}", started.elapsed());
    ExitCode::SUCCESS
}

#[cfg(feature = "viewer")]
fn cmd_view(options: Options) -> ExitCode {
    let settings = load_settings(&options);
    let skybox = options.skybox.map(std::path::PathBuf::from);
    match progressive_tracer::viewer::run(settings, skybox) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Viewer failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(feature = "viewer"))]
fn cmd_view(_options: Options) -> ExitCode {
    eprintln!("This build has no viewer; rebuild with --features viewer");
    ExitCode::FAILURE
}
