//! Path manager: owns every live [`Path`], resolves a
//! requested path name against static and regex-matched dynamic path
//! configurations, and diffs a reloaded [`Config`] against what's running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use regex::Regex;

use crate::config::{Config, PathConfig};
use crate::error::{CoreError, Result};

use super::{Path, PathHandle};

struct CompiledPathConfig {
    config: PathConfig,
    regex: Option<Regex>,
}

impl CompiledPathConfig {
    fn compile(config: PathConfig) -> Result<Self> {
        let regex = if config.is_regex {
            Some(Regex::new(&config.name).map_err(|e| {
                CoreError::InvalidConfig(format!("path '{}': bad regex: {e}", config.name))
            })?)
        } else {
            None
        };
        Ok(Self { config, regex })
    }

    fn matches(&self, name: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(name),
            None => self.config.name == name,
        }
    }
}

struct Inner {
    templates: Vec<CompiledPathConfig>,
    live: HashMap<String, Path>,
    random_start: u32,
    recording_restart_pause: Duration,
}

/// Owns the whole fleet of path actors. `describe`/`add_publisher` spawn a
/// path on first reference to a dynamic name; `reload` adds/removes paths
/// to match a new configuration without disturbing unaffected ones.
pub struct PathManager {
    inner: Mutex<Inner>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
    tick_running: Arc<std::sync::atomic::AtomicBool>,
}

impl PathManager {
    pub fn new(config: Config, random_start: u32) -> Result<Arc<Self>> {
        let recording_restart_pause = config.recording_restart_pause;
        let mut templates = Vec::new();
        for path_config in config.paths {
            templates.push(CompiledPathConfig::compile(path_config)?);
        }
        let manager = Arc::new(Self {
            inner: Mutex::new(Inner {
                templates,
                live: HashMap::new(),
                random_start,
                recording_restart_pause,
            }),
            tick_thread: Mutex::new(None),
            tick_running: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        });
        manager.spawn_static_paths();
        manager.start_tick_loop(Duration::from_secs(1));
        Ok(manager)
    }

    fn spawn_static_paths(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        let statics: Vec<String> = inner
            .templates
            .iter()
            .filter(|t| !t.config.is_regex)
            .map(|t| t.config.name.clone())
            .collect();
        for name in statics {
            let template = inner
                .templates
                .iter()
                .find(|t| t.config.name == name)
                .unwrap();
            let path = Path::spawn_with_recording(
                name.clone(),
                template.config.clone(),
                false,
                inner.random_start,
                inner.recording_restart_pause,
            );
            inner.live.insert(name, path);
        }
    }

    fn start_tick_loop(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let running = self.tick_running.clone();
        let handle = std::thread::spawn(move || {
            while running.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(interval);
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let mut inner = manager.inner.lock().unwrap();
                let mut expired = Vec::new();
                for (name, path) in inner.live.iter() {
                    if path.handle.tick() {
                        expired.push(name.clone());
                    }
                }
                for name in expired {
                    inner.live.remove(&name);
                }
            }
        });
        *self.tick_thread.lock().unwrap() = Some(handle);
    }

    /// Resolve `name` to a running path, spawning a dynamic-path actor on
    /// first reference if a template matches.
    pub fn resolve(&self, name: &str) -> Option<PathHandle> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(path) = inner.live.get(name) {
            return Some(path.handle.clone());
        }
        let template = inner.templates.iter().find(|t| t.matches(name))?;
        let is_dynamic = template.config.is_regex;
        let mut config = template.config.clone();
        config.name = name.to_string();
        let random_start = inner.random_start;
        let path = Path::spawn_with_recording(
            name.to_string(),
            config,
            is_dynamic,
            random_start,
            inner.recording_restart_pause,
        );
        let handle = path.handle.clone();
        inner.live.insert(name.to_string(), path);
        Some(handle)
    }

    /// Diff a freshly loaded [`Config`] against the running set: paths
    /// removed from configuration are terminated, paths whose
    /// configuration changed are replaced, new static paths are spawned.
    /// Dynamic paths with no matching template left are also terminated.
    pub fn reload(self: &Arc<Self>, config: Config) -> Result<()> {
        let mut templates = Vec::new();
        for path_config in config.paths {
            templates.push(CompiledPathConfig::compile(path_config)?);
        }

        let mut inner = self.inner.lock().unwrap();
        let old_templates = std::mem::replace(&mut inner.templates, templates);

        let mut to_remove = Vec::new();
        for (name, _) in inner.live.iter() {
            let still_matches = inner.templates.iter().any(|t| t.matches(name));
            if !still_matches {
                to_remove.push(name.clone());
            }
        }
        for name in &to_remove {
            inner.live.remove(name);
        }

        for name in inner.live.keys().cloned().collect::<Vec<_>>() {
            let old_cfg = old_templates.iter().find(|t| t.matches(&name)).map(|t| &t.config);
            let new_cfg = inner.templates.iter().find(|t| t.matches(&name)).map(|t| &t.config);
            let changed = match (old_cfg, new_cfg) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            };
            if changed {
                if let Some(new_template) = inner.templates.iter().find(|t| t.matches(&name)) {
                    let is_dynamic = new_template.config.is_regex;
                    let mut cfg = new_template.config.clone();
                    cfg.name = name.clone();
                    let random_start = inner.random_start;
                    let path = Path::spawn_with_recording(
                        name.clone(),
                        cfg,
                        is_dynamic,
                        random_start,
                        inner.recording_restart_pause,
                    );
                    inner.live.insert(name.clone(), path);
                }
            }
        }

        let statics: Vec<String> = inner
            .templates
            .iter()
            .filter(|t| !t.config.is_regex && !inner.live.contains_key(&t.config.name))
            .map(|t| t.config.name.clone())
            .collect();
        for name in statics {
            let cfg = inner
                .templates
                .iter()
                .find(|t| t.config.name == name)
                .unwrap()
                .config
                .clone();
            let random_start = inner.random_start;
            let path = Path::spawn_with_recording(
                name.clone(),
                cfg,
                false,
                random_start,
                inner.recording_restart_pause,
            );
            inner.live.insert(name, path);
        }

        Ok(())
    }

    pub fn path_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().live.keys().cloned().collect()
    }
}

impl Drop for PathManager {
    fn drop(&mut self) {
        self.tick_running
            .store(false, std::sync::atomic::Ordering::Relaxed);
        if let Some(t) = self.tick_thread.lock().unwrap().take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathConfig;

    fn config_with(names: &[&str]) -> Config {
        Config {
            paths: names
                .iter()
                .map(|n| PathConfig {
                    name: n.to_string(),
                    is_regex: false,
                    on_demand: Default::default(),
                    describe_timeout: Duration::from_secs(1),
                    stop_after_describe: Duration::from_secs(1),
                    record: None,
                    gop_cache: false,
                    reader_queue_depth: 512,
                })
                .collect(),
            recording_restart_pause: Duration::from_secs(2),
        }
    }

    #[test]
    fn static_paths_spawn_eagerly() {
        let manager = PathManager::new(config_with(&["cam1", "cam2"]), 0).unwrap();
        let mut names = manager.path_names();
        names.sort();
        assert_eq!(names, vec!["cam1".to_string(), "cam2".to_string()]);
    }

    #[test]
    fn dynamic_path_spawns_on_first_resolve() {
        let mut cfg = config_with(&[]);
        cfg.paths.push(PathConfig {
            name: r"^cam-\d+$".to_string(),
            is_regex: true,
            on_demand: Default::default(),
            describe_timeout: Duration::from_secs(1),
            stop_after_describe: Duration::from_secs(1),
            record: None,
            gop_cache: false,
            reader_queue_depth: 512,
        });
        let manager = PathManager::new(cfg, 0).unwrap();
        assert!(manager.path_names().is_empty());
        let handle = manager.resolve("cam-42");
        assert!(handle.is_some());
        assert_eq!(manager.path_names(), vec!["cam-42".to_string()]);
    }

    #[test]
    fn reload_removes_paths_not_in_new_config() {
        let manager = PathManager::new(config_with(&["cam1", "cam2"]), 0).unwrap();
        manager.reload(config_with(&["cam1"])).unwrap();
        assert_eq!(manager.path_names(), vec!["cam1".to_string()]);
    }

    #[test]
    fn unresolvable_name_returns_none() {
        let manager = PathManager::new(config_with(&["cam1"]), 0).unwrap();
        assert!(manager.resolve("doesnotexist").is_none());
    }
}
