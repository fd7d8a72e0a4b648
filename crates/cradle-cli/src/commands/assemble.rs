//! The end-to-end setup flow: prepare the runtime copy, enumerate and
//! capture the provider's drivers, and emit the construction plan.

use crate::commands::CommandError;
use cradle_graphics::{
    module_search_path_env, prune_shadowed, related_capture_patterns, AbiManifest, AliasResolver,
    Architecture, ArchitectureContext, CaptureHelper, Classification, DataCoLocator, DriverBatch,
    DriverKind, DriverRecord, EnumerationJob, EnumerationTasks, GraphicsError, ManifestRewriter,
    OverridesTree, ResolvedRef, SystemInfoCache,
};
use cradle_plan::{
    default_root_select, ConstructionPlan, InPlaceRealizer, LaunchInvocation, PathRealizer,
    PlanRealizer,
};
use cradle_runtime::{create_scratch_root, MutableCopy, RuntimeStore};
use cradle_sysroot::{Provider, Sysroot};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const JSON_KINDS: &[DriverKind] = &[
    DriverKind::VulkanIcd,
    DriverKind::VulkanExplicitLayer,
    DriverKind::VulkanImplicitLayer,
    DriverKind::EglIcd,
    DriverKind::EglExternalPlatform,
    DriverKind::OpenXr,
];

const MODULE_KINDS: &[DriverKind] = &[DriverKind::Dri, DriverKind::VaApi, DriverKind::Vdpau];

/// Where the interpreter (emulator) sees the real host root mounted.
const INTERPRETER_MOUNT: &str = "/run/interpreter-host";

/// The base GL/Vulkan/video stack, captured by SONAME for every usable
/// architecture regardless of what the manifests declare.
const BASE_STACK_SONAMES: &[&str] = &[
    "libGL.so.1",
    "libEGL.so.1",
    "libGLESv1_CM.so.1",
    "libGLESv2.so.2",
    "libvulkan.so.1",
    "libvdpau.so.1",
    "libva.so.2",
    "libva-drm.so.2",
    "libva-x11.so.2",
];

const BASE_STACK_GLOBS: &[&str] = &[
    "libGLX_*.so.*",
    "libEGL_*.so.*",
    "libGLESv2_*.so.*",
    "libdrm*.so.*",
    "libnvidia-*.so.*",
];

#[derive(Debug)]
pub struct AssembleOptions {
    pub runtime: PathBuf,
    pub variable_dir: PathBuf,
    pub provider: PathBuf,
    pub provider_in_host_ns: PathBuf,
    pub graphics_mount: PathBuf,
    pub capture_tool_dir: PathBuf,
    pub abi_manifest: Option<PathBuf>,
    pub interpreter_root: Option<PathBuf>,
    pub single_thread: bool,
    pub keep_copy: bool,
    /// Materialize a mutable runtime copy and edit it in place. When
    /// false the runtime is used read-only and every filesystem edit
    /// travels as a launcher operation instead.
    pub copy_runtime: bool,
}

pub fn run(
    options: &AssembleOptions,
    json: bool,
    output: Option<&Path>,
) -> Result<(), CommandError> {
    let invocation = assemble(options)?;
    let rendered = if json {
        let mut s = serde_json::to_string_pretty(&invocation)?;
        s.push('\n');
        s
    } else {
        render_args(&invocation)
    };
    match output {
        Some(path) => std::fs::write(path, rendered).map_err(|source| CommandError::Output {
            path: path.to_owned(),
            source,
        }),
        None => std::io::stdout()
            .write_all(rendered.as_bytes())
            .map_err(|source| CommandError::Output {
                path: PathBuf::from("-"),
                source,
            }),
    }
}

fn render_args(invocation: &LaunchInvocation) -> String {
    let mut out = String::new();
    for arg in invocation.to_args() {
        out.push_str(&arg.to_string_lossy());
        out.push('\n');
    }
    for assignment in invocation.env_assignments() {
        out.push_str(&assignment);
        out.push('\n');
    }
    out
}

/// Runs the whole setup and returns the finished plan. Locks held on the
/// mutable copy are released when the store is dropped; a launcher that
/// needs the copy kept alive re-acquires inside the container.
pub fn assemble(options: &AssembleOptions) -> Result<LaunchInvocation, CommandError> {
    let mut store = RuntimeStore::open(&options.runtime)?;

    // In-place use requires the on-disk tree to already look like the
    // final container root. Merged-/usr trees and legacy runtimes get
    // their layout fixed up while copying, so they always take the copy
    // path. The choice is made once, here; everything downstream routes
    // filesystem edits through whichever backend it implies.
    let mut copy_runtime = options.copy_runtime;
    if !copy_runtime && store.tree().is_merged_usr() {
        info!("runtime ships bare /usr contents, materializing a mutable copy");
        copy_runtime = true;
    }
    if !copy_runtime && store.os_release().is_legacy_steamrt() {
        info!("legacy runtime needs copy-time normalization, materializing a mutable copy");
        copy_runtime = true;
    }

    let mut scratch: Option<MutableCopy> = None;
    if copy_runtime {
        store.make_mutable_copy(&options.variable_dir)?;
        if options.keep_copy {
            if let Some(copy) = store.mutable_copy() {
                copy.mark_keep()?;
            }
        }
    } else {
        let dir = create_scratch_root(&options.variable_dir)?;
        if options.keep_copy {
            dir.mark_keep()?;
        }
        scratch = Some(dir);
    }
    let root = store.effective_root();

    let provider = Provider::new(
        Sysroot::open(&options.provider)?,
        &options.provider_in_host_ns,
        &options.graphics_mount,
    );
    let arches = usable_architectures(&root, &provider)?;
    info!(
        arches = ?arches.iter().map(|a| a.tuple()).collect::<Vec<_>>(),
        "assembling container"
    );

    // Enumeration runs in the background while the overrides skeleton and
    // record sets are prepared.
    let cache = Arc::new(SystemInfoCache::new(provider.clone()));
    let mut jobs = vec![EnumerationJob::ArchIndependent];
    jobs.extend(arches.iter().map(|&a| EnumerationJob::PerArchitecture(a)));
    let mut tasks = EnumerationTasks::start(Arc::clone(&cache), &jobs, options.single_thread);

    // The overrides tree lives in the mutable copy, or in the locked
    // scratch directory when the runtime is used in place.
    let overrides_parent = match &scratch {
        Some(dir) => dir.root().to_owned(),
        None => root.clone(),
    };
    let overrides = OverridesTree::create(overrides_parent.join("overrides"), "/overrides")?;
    let contexts: Vec<ArchitectureContext> = arches
        .iter()
        .map(|&arch| {
            ArchitectureContext::new(
                arch,
                overrides.libdir(arch),
                overrides.aliasdir(arch),
                options
                    .capture_tool_dir
                    .join(format!("cradle-capture-libs-{}", arch.tuple())),
            )
        })
        .collect();

    tasks.join(0);
    let mut json_records: BTreeMap<DriverKind, Vec<DriverRecord>> = BTreeMap::new();
    for &kind in JSON_KINDS {
        let records = cache
            .drivers(kind, None)
            .iter()
            .cloned()
            .map(DriverRecord::new)
            .collect();
        json_records.insert(kind, records);
    }
    let mut module_records: BTreeMap<(DriverKind, Architecture), Vec<DriverRecord>> =
        BTreeMap::new();

    for (index, ctx) in contexts.iter().enumerate() {
        let arch = ctx.arch();
        tasks.join(index + 1);
        let helper = CaptureHelper::new(
            ctx.capture_tool(),
            provider.sysroot().root(),
            provider.container_mount_point(),
        );

        capture_base_stack(&helper, ctx)?;

        for (&kind, records) in &mut json_records {
            DriverBatch::new(kind, arch, &provider, &overrides, &helper).process(records)?;
        }
        for &kind in MODULE_KINDS {
            let mut records: Vec<DriverRecord> = cache
                .drivers(kind, Some(arch))
                .iter()
                .cloned()
                .map(DriverRecord::new)
                .collect();
            DriverBatch::new(kind, arch, &provider, &overrides, &helper)
                .process(&mut records)?;
            module_records.insert((kind, arch), records);
        }

        capture_related_families(&helper, ctx)?;

        if let Some(abi_path) = &options.abi_manifest {
            let manifest = AbiManifest::load(abi_path)?;
            AliasResolver::new(arch, &overrides, &root).resolve_all(&manifest)?;
        }

        if copy_runtime {
            // Strictly after every capture for this architecture.
            let pruned = prune_shadowed(&root, &overrides, arch)?;
            debug!(
                tuple = ctx.tuple(),
                pruned = pruned.len(),
                "architecture processed"
            );
        } else {
            // The runtime stays read-only; overrides shadow its libraries
            // through search order instead of deletion.
            debug!(tuple = ctx.tuple(), "architecture processed");
        }
    }

    let mut rewriter = ManifestRewriter::new(&overrides, &provider);
    let mut colocator = DataCoLocator::new(&provider);
    for (&kind, records) in &json_records {
        for record in records {
            for &arch in &arches {
                rewriter.emit(record, arch)?;
                if matches!(kind, DriverKind::VulkanIcd | DriverKind::EglIcd) {
                    locate_driver_data(&mut colocator, record, arch);
                }
            }
        }
    }
    for ((kind, arch), records) in &module_records {
        if *kind != DriverKind::Dri {
            continue;
        }
        for record in records {
            locate_driver_data(&mut colocator, record, *arch);
        }
    }

    let mut plan = ConstructionPlan::new();
    match &scratch {
        Some(dir) => {
            plan.ro_bind(&root, "/");
            plan.ro_bind(dir.root().join("overrides"), "/overrides");
            if let Some(interpreter_root) = &options.interpreter_root {
                plan.ro_bind(interpreter_root, INTERPRETER_MOUNT);
            }
        }
        None => plan.bind(&root, "/"),
    }
    plan.ro_bind(
        provider.in_host_ns("/"),
        provider.container_mount_point(),
    );
    for mount in colocator.mounts() {
        plan.ro_bind(provider.in_host_ns(&mount.source), mount.container_path);
    }

    // One realization backend for the whole invocation: writes land in
    // the mutable copy, or travel as launcher operations over the
    // read-only runtime.
    let mut in_place_backend;
    let mut plan_backend;
    let realizer: &mut dyn PathRealizer = if scratch.is_none() {
        let mut backend = InPlaceRealizer::new(&root);
        if let Some(interpreter_root) = &options.interpreter_root {
            backend = backend.with_interpreter_root(interpreter_root);
        }
        in_place_backend = backend;
        &mut in_place_backend
    } else {
        let mut backend = PlanRealizer::new(&mut plan);
        if options.interpreter_root.is_some() {
            backend = backend.with_interpreter_prefix(INTERPRETER_MOUNT);
        }
        plan_backend = backend;
        &mut plan_backend
    };
    write_loader_config(realizer, &overrides, &arches)?;

    for (key, value) in rewriter.finish() {
        plan.set_env(key, value);
    }
    for &kind in MODULE_KINDS {
        if let Some((var, value)) = module_search_path_env(kind, &overrides, &arches) {
            plan.set_env(var, value);
        }
    }
    for ctx in &contexts {
        plan.append_search_path(
            "LD_LIBRARY_PATH",
            &overrides.container_libdir(ctx.arch()).to_string_lossy(),
        );
        // The aliases entry is only worth a search-path slot when alias
        // reconciliation actually produced links.
        let has_aliases = std::fs::read_dir(ctx.overrides_aliasdir())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if has_aliases {
            plan.append_search_path(
                "LD_LIBRARY_PATH",
                &overrides
                    .container_libdir(ctx.arch())
                    .join("aliases")
                    .to_string_lossy(),
            );
        }
    }
    plan.append_search_path("XDG_DATA_DIRS", "/overrides/share");
    plan.append_search_path("XDG_DATA_DIRS", "/usr/local/share");
    plan.append_search_path("XDG_DATA_DIRS", "/usr/share");

    Ok(plan.finish())
}

/// An architecture counts when the runtime ships its multiarch library
/// directory and the provider has at least one library directory for it.
fn usable_architectures(
    runtime_root: &Path,
    provider: &Provider,
) -> Result<Vec<Architecture>, CommandError> {
    let mut usable = Vec::new();
    for arch in Architecture::ALL {
        let runtime_ok = runtime_root.join("usr/lib").join(arch.tuple()).is_dir()
            || runtime_root.join("lib").join(arch.tuple()).is_dir();
        let provider_ok = arch
            .lib_dirs()
            .iter()
            .any(|dir| provider.in_current_ns(dir).is_dir());
        if runtime_ok && provider_ok {
            usable.push(arch);
        } else {
            debug!(
                tuple = arch.tuple(),
                runtime_ok, provider_ok, "architecture not usable"
            );
        }
    }
    if usable.is_empty() {
        let tried = Architecture::ALL
            .iter()
            .map(|a| a.tuple())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(GraphicsError::NoCommonArchitecture(tried).into());
    }
    Ok(usable)
}

fn capture_base_stack(
    helper: &CaptureHelper,
    ctx: &ArchitectureContext,
) -> Result<(), CommandError> {
    let flags = cradle_graphics::PatternFlags {
        if_exists: true,
        ..cradle_graphics::PatternFlags::default()
    };
    let mut patterns: Vec<cradle_graphics::CapturePattern> = BASE_STACK_SONAMES
        .iter()
        .map(|s| cradle_graphics::CapturePattern::soname(*s).with_flags(flags))
        .collect();
    patterns.extend(
        BASE_STACK_GLOBS
            .iter()
            .map(|g| cradle_graphics::CapturePattern::soname_glob(*g).with_flags(flags)),
    );
    helper.capture_into(ctx.overrides_libdir(), &patterns)?;
    Ok(())
}

/// Libraries that must be ABI-matched to a captured primary (glibc's NSS
/// plugins, libxkbcommon's X11 half) are captured whenever the primary
/// came from the provider, even if the provider's copies are older.
fn capture_related_families(
    helper: &CaptureHelper,
    ctx: &ArchitectureContext,
) -> Result<(), CommandError> {
    let libdir = ctx.overrides_libdir();
    for family in cradle_graphics::RELATED_SONAMES {
        if std::fs::symlink_metadata(libdir.join(family.primary)).is_ok() {
            helper.capture_into(libdir, &related_capture_patterns(family.primary))?;
        }
    }
    Ok(())
}

fn locate_driver_data(colocator: &mut DataCoLocator<'_>, record: &DriverRecord, arch: Architecture) {
    if record.classification(arch) != Some(Classification::Absolute) {
        return;
    }
    let Some(ResolvedRef::Absolute(path)) = record.resolved(arch) else {
        return;
    };
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if basename.contains("nvidia") {
        // Proprietary stacks hard-code /usr/share regardless of prefix.
        colocator.locate(path, "nvidia", true);
    } else {
        colocator.locate(path, "drirc.d", false);
    }
}

/// Writes the dynamic-linker configuration pointing at the overrides
/// directories, through whichever realization backend setup selected.
fn write_loader_config(
    realizer: &mut dyn PathRealizer,
    overrides: &OverridesTree,
    arches: &[Architecture],
) -> Result<(), CommandError> {
    let mut conf = String::from("# written by cradle\n");
    for &arch in arches {
        conf.push_str(&overrides.container_libdir(arch).to_string_lossy());
        conf.push('\n');
    }
    let conf_path = Path::new("/etc/ld.so.conf.d/000-cradle.conf");
    realizer.write_data(conf.as_bytes(), conf_path, default_root_select(conf_path))?;
    Ok(())
}
