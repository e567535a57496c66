//! Operator-facing control surface over every supervised instance.
use std::{
    mem,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};
use tracing::{info, warn};

use crate::{
    config::{AppSpec, Config, RejectedApp, load_config},
    error::ProcessManagerError,
    supervisor::{AppState, InstanceStatus, Supervisor, SupervisorOptions},
};

struct AppGroup {
    spec: Arc<AppSpec>,
    instances: Vec<Arc<Supervisor>>,
}

impl AppGroup {
    fn spawn(spec: Arc<AppSpec>, profile: Option<&str>, options: &SupervisorOptions) -> Self {
        let instances = (0..spec.instances)
            .map(|index| {
                Arc::new(Supervisor::spawn(
                    Arc::clone(&spec),
                    index,
                    profile.map(str::to_string),
                    options.clone(),
                ))
            })
            .collect();
        Self { spec, instances }
    }
}

/// Accepted apps with their supervisors, plus the apps the last config read rejected.
#[derive(Default)]
struct Registry {
    groups: Vec<AppGroup>,
    rejected: Vec<RejectedApp>,
}

impl Registry {
    fn rejected_error(&self, target: Option<&str>) -> Option<ProcessManagerError> {
        let name = target?;
        self.rejected
            .iter()
            .find(|r| r.name == name)
            .map(|r| ProcessManagerError::Reported(r.error.clone()))
    }

    fn group_mut(&mut self, app: &str) -> Option<&mut AppGroup> {
        self.groups.iter_mut().find(|g| g.spec.name == app)
    }
}

/// Which instances a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection<'a> {
    All,
    App(&'a str),
    Instance(&'a str, usize),
}

/// Accepts an app name or `<app>:<index>`.
fn parse_target<'a>(
    groups: &[AppGroup],
    target: Option<&'a str>,
) -> Result<Selection<'a>, ProcessManagerError> {
    let Some(target) = target else {
        return Ok(Selection::All);
    };
    let unknown = || ProcessManagerError::UnknownTarget(target.to_string());
    let group = |name: &str| groups.iter().find(|group| group.spec.name == name);

    if group(target).is_some() {
        return Ok(Selection::App(target));
    }

    let (app, index) = target.rsplit_once(':').ok_or_else(unknown)?;
    let index: usize = index.parse().map_err(|_| unknown())?;
    match group(app) {
        Some(found) if index < found.instances.len() => Ok(Selection::Instance(app, index)),
        _ => Err(unknown()),
    }
}

fn select(
    groups: &[AppGroup],
    target: Option<&str>,
) -> Result<Vec<Arc<Supervisor>>, ProcessManagerError> {
    let selected = match parse_target(groups, target)? {
        Selection::All => groups.iter().flat_map(|g| g.instances.iter()).cloned().collect(),
        Selection::App(app) => groups
            .iter()
            .filter(|g| g.spec.name == app)
            .flat_map(|g| g.instances.iter())
            .cloned()
            .collect(),
        Selection::Instance(app, index) => groups
            .iter()
            .filter(|g| g.spec.name == app)
            .filter_map(|g| g.instances.get(index))
            .cloned()
            .collect(),
    };
    Ok(selected)
}

/// Owns one [`Supervisor`] per instance and routes commands to them.
///
/// The registry lock is only held to resolve targets and to add or retire
/// instances; every call that waits on a process runs without it.
pub struct ControlSurface {
    config_path: Option<PathBuf>,
    options: SupervisorOptions,
    profile: Option<String>,
    registry: RwLock<Registry>,
    /// One reload at a time, so config reads and scaling never interleave.
    reloading: Mutex<()>,
}

impl ControlSurface {
    /// Builds supervisors for every accepted app. Nothing is started yet.
    pub fn new(config: Config, profile: Option<String>, options: SupervisorOptions) -> Self {
        for rejected in &config.rejected {
            warn!("Skipping app '{}': {}", rejected.name, rejected.error.message);
        }
        let groups = config
            .apps
            .into_iter()
            .map(|spec| AppGroup::spawn(Arc::new(spec), profile.as_deref(), &options))
            .collect();

        Self {
            config_path: config.path,
            options,
            profile,
            registry: RwLock::new(Registry {
                groups,
                rejected: config.rejected,
            }),
            reloading: Mutex::new(()),
        }
    }

    /// Loads the config at `config_path` (or the default location) and builds supervisors.
    pub fn load(
        config_path: Option<&Path>,
        profile: Option<String>,
        options: SupervisorOptions,
    ) -> Result<Self, ProcessManagerError> {
        let config = load_config(config_path)?;
        Ok(Self::new(config, profile, options))
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Handles for the target, resolved under a short read lock.
    fn handles(&self, target: Option<&str>) -> Result<Vec<Arc<Supervisor>>, ProcessManagerError> {
        let registry = self.registry.read()?;
        if let Some(err) = registry.rejected_error(target) {
            return Err(err);
        }
        select(&registry.groups, target)
    }

    /// Runs `op` on every selected instance; one instance failing does not skip the others.
    fn for_each<F>(&self, target: Option<&str>, op: F) -> Result<(), ProcessManagerError>
    where
        F: Fn(&Supervisor) -> Result<(), ProcessManagerError>,
    {
        let mut first_error = None;
        for supervisor in self.handles(target)? {
            if let Err(err) = op(&supervisor) {
                warn!("'{}': {err}", supervisor.name());
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Starts the target (or everything). `profile` overrides the surface-wide env profile.
    pub fn start(
        &self,
        target: Option<&str>,
        profile: Option<&str>,
    ) -> Result<(), ProcessManagerError> {
        let profile = profile.map(str::to_string).or_else(|| self.profile.clone());
        self.for_each(target, |supervisor| supervisor.start(profile.clone()))
    }

    pub fn stop(&self, target: Option<&str>) -> Result<(), ProcessManagerError> {
        self.for_each(target, Supervisor::stop)
    }

    pub fn restart(&self, target: Option<&str>) -> Result<(), ProcessManagerError> {
        self.for_each(target, Supervisor::restart)
    }

    /// Re-reads the config, then stops and starts the target with the refreshed spec.
    ///
    /// Reloading a whole app also grows or shrinks its instance set to the new count,
    /// and brings up an app that was rejected before if the config now accepts it.
    pub fn reload(&self, target: &str, profile: Option<&str>) -> Result<(), ProcessManagerError> {
        let _reloading = self.reloading.lock()?;
        let profile = profile.map(str::to_string);

        let (app, single, was_rejected) = {
            let registry = self.registry.read()?;
            match parse_target(&registry.groups, Some(target)) {
                Ok(Selection::App(app)) => (app.to_string(), None, false),
                Ok(Selection::Instance(app, index)) => (app.to_string(), Some(index), false),
                Ok(Selection::All) => {
                    return Err(ProcessManagerError::UnknownTarget(target.to_string()));
                }
                Err(_) if registry.rejected.iter().any(|r| r.name == target) => {
                    (target.to_string(), None, true)
                }
                Err(err) => return Err(err),
            }
        };

        let refreshed = self.refreshed_spec(&app)?;
        if was_rejected {
            return match refreshed {
                Some(spec) => self.revive(spec, profile),
                None => Err(self
                    .registry
                    .read()?
                    .rejected_error(Some(&app))
                    .unwrap_or_else(|| ProcessManagerError::UnknownTarget(app.clone()))),
            };
        }

        let effective = profile.clone().or_else(|| self.profile.clone());
        let (spec, current, retired, added) = {
            let mut registry = self.registry.write()?;
            let Some(group) = registry.group_mut(&app) else {
                return Err(ProcessManagerError::UnknownTarget(target.to_string()));
            };
            if let Some(spec) = refreshed {
                group.spec = Arc::new(spec);
            }
            let spec = Arc::clone(&group.spec);

            if let Some(index) = single {
                let supervisor = group
                    .instances
                    .get(index)
                    .cloned()
                    .ok_or_else(|| ProcessManagerError::UnknownTarget(target.to_string()))?;
                drop(registry);
                return supervisor.reload(Some(spec), profile);
            }

            let keep = group.instances.len().min(spec.instances);
            let retired = group.instances.split_off(keep);
            let added: Vec<_> = (keep..spec.instances)
                .map(|index| {
                    Arc::new(Supervisor::spawn(
                        Arc::clone(&spec),
                        index,
                        effective.clone(),
                        self.options.clone(),
                    ))
                })
                .collect();
            let current: Vec<_> = group.instances.clone();
            group.instances.extend(added.iter().cloned());
            (spec, current, retired, added)
        };

        let mut first_error = None;
        for extra in retired {
            info!("Scaling '{app}' down: retiring '{}'", extra.name());
            if let Err(err) = extra.shutdown() {
                first_error.get_or_insert(err);
            }
        }
        for supervisor in current {
            if let Err(err) = supervisor.reload(Some(Arc::clone(&spec)), profile.clone()) {
                first_error.get_or_insert(err);
            }
        }
        for supervisor in added {
            info!("Scaling '{app}' up: starting '{}'", supervisor.name());
            if let Err(err) = supervisor.start(effective.clone()) {
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Promotes a previously rejected app that now validates and starts it.
    fn revive(&self, spec: AppSpec, profile: Option<String>) -> Result<(), ProcessManagerError> {
        let profile = profile.or_else(|| self.profile.clone());
        let group = AppGroup::spawn(Arc::new(spec), profile.as_deref(), &self.options);
        let app = group.spec.name.clone();
        let instances = group.instances.clone();
        {
            let mut registry = self.registry.write()?;
            registry.rejected.retain(|r| r.name != app);
            registry.groups.push(group);
        }
        info!("App '{app}' now passes validation; starting it");

        let mut first_error = None;
        for supervisor in instances {
            if let Err(err) = supervisor.start(profile.clone()) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Latest spec for `app` from the config file, if there is one to re-read.
    ///
    /// A rejection replaces the stored error for an app that is already rejected.
    fn refreshed_spec(&self, app: &str) -> Result<Option<AppSpec>, ProcessManagerError> {
        let Some(path) = &self.config_path else {
            return Ok(None);
        };
        let config = load_config(Some(path))?;
        if let Some(rejected) = config.rejected.into_iter().find(|r| r.name == app) {
            let err = ProcessManagerError::Reported(rejected.error.clone());
            let mut registry = self.registry.write()?;
            if let Some(stored) = registry.rejected.iter_mut().find(|r| r.name == app) {
                *stored = rejected;
            }
            return Err(err);
        }
        match config.apps.into_iter().find(|spec| spec.name == app) {
            Some(spec) => Ok(Some(spec)),
            None => {
                warn!(
                    "App '{app}' is no longer in {}; keeping its current spec",
                    path.display()
                );
                Ok(None)
            }
        }
    }

    /// Snapshots for the target. Listing everything includes rejected apps.
    pub fn status(
        &self,
        target: Option<&str>,
    ) -> Result<Vec<InstanceStatus>, ProcessManagerError> {
        let registry = self.registry.read()?;
        let mut statuses: Vec<InstanceStatus> = registry
            .rejected
            .iter()
            .filter(|r| target.is_none_or(|name| r.name == name))
            .map(rejected_status)
            .collect();

        if statuses.is_empty() || target.is_none() {
            statuses.extend(
                select(&registry.groups, target)?
                    .iter()
                    .map(|supervisor| supervisor.status()),
            );
        }
        Ok(statuses)
    }

    /// Stops everything and ends all worker threads.
    pub fn shutdown(&self) -> Result<(), ProcessManagerError> {
        let groups = mem::take(&mut self.registry.write()?.groups);
        info!("Shutting down {} app(s)", groups.len());

        let mut first_error = None;
        for supervisor in groups.into_iter().flat_map(|g| g.instances) {
            if let Err(err) = supervisor.shutdown() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn rejected_status(rejected: &RejectedApp) -> InstanceStatus {
    InstanceStatus {
        name: rejected.name.clone(),
        app: rejected.name.clone(),
        index: 0,
        state: AppState::Errored,
        pid: None,
        started_at: None,
        uptime_ms: None,
        restarts: 0,
        unstable_restarts: 0,
        memory_bytes: None,
        last_error: Some(rejected.error.clone()),
        last_exit: None,
    }
}
