//! Launching managed programs and signalling their process groups.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    collections::BTreeMap,
    env,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
};
use tracing::debug;

use crate::{
    config::AppSpec,
    constants::{INSTANCE_ENV_VAR, NODE_INSTANCE_ENV_VAR},
    error::ProcessManagerError,
    logs::{LogSink, StreamKind, spawn_log_writer},
};

/// Fully resolved invocation for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Looks `name` up on `$PATH`.
fn which(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn is_bare_name(script: &str) -> bool {
    !script.contains('/')
}

fn resolve_script(spec: &AppSpec, for_interpreter: bool) -> PathBuf {
    let script = spec.script.as_str();
    let local = spec.cwd.join(script);
    if !is_bare_name(script) {
        return if Path::new(script).is_absolute() {
            PathBuf::from(script)
        } else {
            local
        };
    }

    if for_interpreter {
        // `node npm` needs a path, not a bare command name.
        if local.is_file() {
            return local;
        }
        if let Some(found) = which(script) {
            return found;
        }
    }
    PathBuf::from(script)
}

fn is_node(interpreter: &str) -> bool {
    Path::new(interpreter)
        .file_name()
        .map(|name| name == "node" || name == "nodejs")
        .unwrap_or(false)
}

/// Resolves program, arguments and environment for instance `index` under `profile`.
pub fn plan_launch(spec: &AppSpec, index: usize, profile: Option<&str>) -> LaunchPlan {
    let mut env = spec.env_for(profile);
    env.insert(INSTANCE_ENV_VAR.to_string(), index.to_string());
    env.insert(NODE_INSTANCE_ENV_VAR.to_string(), index.to_string());

    let (program, args) = match &spec.interpreter {
        Some(interpreter) => {
            let mut args = spec.interpreter_args.clone();
            if spec.source_map_support
                && is_node(interpreter)
                && !args.iter().any(|a| a == "--enable-source-maps")
            {
                args.push("--enable-source-maps".to_string());
            }
            args.push(resolve_script(spec, true).to_string_lossy().to_string());
            args.extend(spec.args.iter().cloned());
            (PathBuf::from(interpreter), args)
        }
        None => (resolve_script(spec, false), spec.args.clone()),
    };

    LaunchPlan {
        program,
        args,
        cwd: spec.cwd.clone(),
        env,
    }
}

/// Spawns the plan in its own process group with output pumped into `sink`.
pub fn launch(
    instance: &str,
    plan: &LaunchPlan,
    sink: &Arc<LogSink>,
) -> Result<Child, ProcessManagerError> {
    debug!("Launching '{instance}': {:?} {:?}", plan.program, plan.args);

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .current_dir(&plan.cwd)
        .envs(&plan.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    unsafe {
        cmd.pre_exec(|| {
            // Own process group so signals reach the whole tree without touching ours.
            if libc::setpgid(0, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|source| ProcessManagerError::SpawnError {
            instance: instance.to_string(),
            source,
        })?;

    if let Some(out) = child.stdout.take() {
        spawn_log_writer(Arc::clone(sink), out, StreamKind::Stdout);
    }
    if let Some(err) = child.stderr.take() {
        spawn_log_writer(Arc::clone(sink), err, StreamKind::Stderr);
    }

    debug!("'{instance}' started with PID {}", child.id());
    Ok(child)
}

/// Sends `sig` to the process group led by `pid`, falling back to the process itself.
/// A process that is already gone is not an error.
pub fn signal_group(pid: u32, sig: Signal) -> Result<(), std::io::Error> {
    let target = Pid::from_raw(pid as i32);
    match signal::killpg(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(Errno::EPERM) => {
            debug!("No permission to signal group {pid}; signalling the process directly");
        }
        Err(err) => return Err(std::io::Error::from_raw_os_error(err as i32)),
    }

    match signal::kill(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(std::io::Error::from_raw_os_error(err as i32)),
    }
}
