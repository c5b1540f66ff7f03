//! Persisted catalog of named server identities.
//!
//! The registry owns the server list: uniqueness by name, the folder
//! hierarchy embedded in names, persistence through the settings codec, and
//! listener notification. All mutations run under one coarse lock and are
//! followed by a save and a `pref_change` notification; notifications are
//! delivered after the persistence write, outside the lock.
//!
//! Several processes may share the settings store, so before every mutation
//! the registry reloads the persisted list and reconciles: when the two
//! differ, the persisted version wins and listeners learn of the overwrite.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::codec;
use crate::error::{QdeskError, Result};
use crate::pool::ConnectionManager;
use crate::server::{clean_folder_name, ServerConfig};
use crate::store::SettingsStore;

/// Observer for registry changes. All callbacks default to no-ops.
pub trait RegistryListener: Send + Sync {
    /// The server list changed in some way.
    fn pref_change(&self) {}

    /// A server was added.
    fn server_added(&self, server: &ServerConfig) {
        let _ = server;
    }

    /// The in-memory list was replaced by a newer persisted one.
    fn list_overwritten(&self) {}
}

pub struct ConnectionRegistry {
    store: Arc<dyn SettingsStore>,
    manager: Arc<ConnectionManager>,
    inner: Mutex<Vec<ServerConfig>>,
    listeners: Mutex<Vec<Arc<dyn RegistryListener>>>,
}

impl ConnectionRegistry {
    /// Load the registry from the store. A corrupt payload is logged and
    /// treated as no prior configuration rather than failing startup.
    pub fn new(store: Arc<dyn SettingsStore>, manager: Arc<ConnectionManager>) -> Self {
        let servers = match codec::load_servers(store.as_ref()) {
            Ok(Some(mut servers)) => {
                servers.sort_by(|a, b| a.name.cmp(&b.name));
                servers
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("ignoring corrupt saved server list: {}", e);
                Vec::new()
            }
        };
        Self {
            store,
            manager,
            inner: Mutex::new(servers),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Add one server. Fails with a duplicate-name error when an
    /// equal-named but differently-configured entry exists; re-adding an
    /// identical entry is a no-op.
    pub fn add(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);

        match inner.iter().find(|c| c.name == config.name) {
            Some(existing) if *existing == config => {
                drop(inner);
                self.notify_overwritten(overwritten);
                return Ok(());
            }
            Some(_) => {
                drop(inner);
                self.notify_overwritten(overwritten);
                return Err(QdeskError::DuplicateName(config.name));
            }
            None => {}
        }

        let previous = inner.clone();
        inner.push(config.clone());
        inner.sort_by(|a, b| a.name.cmp(&b.name));
        self.commit(&mut inner, previous)?;
        drop(inner);

        self.notify_overwritten(overwritten);
        self.notify(|l| l.server_added(&config));
        self.notify(|l| l.pref_change());
        Ok(())
    }

    /// Add many servers in one save, returning the subset that failed
    /// (invalid, or duplicate of a differently-configured entry).
    pub fn add_all(&self, configs: Vec<ServerConfig>) -> Result<Vec<ServerConfig>> {
        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);
        let previous = inner.clone();

        let mut failed = Vec::new();
        let mut added = Vec::new();
        for config in configs {
            if config.validate().is_err() {
                failed.push(config);
                continue;
            }
            match inner.iter().find(|c| c.name == config.name) {
                Some(existing) if *existing == config => {}
                Some(_) => failed.push(config),
                None => {
                    inner.push(config.clone());
                    added.push(config);
                }
            }
        }

        if added.is_empty() {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Ok(failed);
        }

        inner.sort_by(|a, b| a.name.cmp(&b.name));
        self.commit(&mut inner, previous)?;
        drop(inner);

        self.notify_overwritten(overwritten);
        for config in &added {
            self.notify(|l| l.server_added(config));
        }
        self.notify(|l| l.pref_change());
        Ok(failed)
    }

    /// Replace the entry named `old_name` with `config`. Fails when the new
    /// name is already taken by a different entry. Both the old and the new
    /// identity have their pools closed before listeners are notified.
    pub fn update(&self, old_name: &str, config: ServerConfig) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);

        let Some(index) = inner.iter().position(|c| c.name == old_name) else {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Err(QdeskError::NotFound(old_name.to_string()));
        };
        if inner
            .iter()
            .enumerate()
            .any(|(i, c)| i != index && c.name == config.name)
        {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Err(QdeskError::DuplicateName(config.name));
        }

        let previous = inner.clone();
        let old = std::mem::replace(&mut inner[index], config.clone());
        inner.sort_by(|a, b| a.name.cmp(&b.name));
        self.commit(&mut inner, previous)?;
        drop(inner);

        self.manager.close_pool(&old);
        self.manager.close_pool(&config);
        self.notify_overwritten(overwritten);
        self.notify(|l| l.pref_change());
        Ok(())
    }

    /// Remove the entry with the given name, closing its pool.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);

        let Some(index) = inner.iter().position(|c| c.name == name) else {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Err(QdeskError::NotFound(name.to_string()));
        };

        let previous = inner.clone();
        let removed = inner.remove(index);
        self.commit(&mut inner, previous)?;
        drop(inner);

        self.manager.close_pool(&removed);
        self.notify_overwritten(overwritten);
        self.notify(|l| l.pref_change());
        Ok(())
    }

    /// Remove every entry and close every pool.
    pub fn remove_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);
        let previous = inner.clone();
        inner.clear();
        self.commit(&mut inner, previous)?;
        drop(inner);

        self.manager.close_all();
        self.notify_overwritten(overwritten);
        self.notify(|l| l.pref_change());
        Ok(())
    }

    /// Move one server into a folder (possibly the root), keeping its
    /// display name.
    pub fn move_to_folder(&self, name: &str, folder: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);

        let Some(index) = inner.iter().position(|c| c.name == name) else {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Err(QdeskError::NotFound(name.to_string()));
        };

        let folder = clean_folder_name(folder);
        let display = inner[index].display_name().to_string();
        let new_name = if folder.is_empty() {
            display
        } else {
            format!("{}/{}", folder, display)
        };
        if new_name == inner[index].name {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Ok(());
        }
        if inner.iter().any(|c| c.name == new_name) {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Err(QdeskError::DuplicateName(new_name));
        }

        let previous = inner.clone();
        let old = inner[index].clone();
        inner[index].name = new_name;
        inner.sort_by(|a, b| a.name.cmp(&b.name));
        self.commit(&mut inner, previous)?;
        drop(inner);

        self.manager.close_pool(&old);
        self.notify_overwritten(overwritten);
        self.notify(|l| l.pref_change());
        Ok(())
    }

    /// Rename a folder, merging into the target when it already has
    /// members. Returns the count moved; a source folder with no members is
    /// a no-op returning 0. A member whose new name would collide with an
    /// existing entry stays where it is.
    pub fn rename_folder(&self, from: &str, to: &str) -> Result<usize> {
        let from = clean_folder_name(from);
        let to = clean_folder_name(to);
        if from.is_empty() || from == to {
            return Ok(0);
        }
        let from_segments: Vec<&str> = from.split('/').collect();

        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);
        let previous = inner.clone();

        let taken: BTreeSet<String> = inner.iter().map(|c| c.name.clone()).collect();
        let mut moved = Vec::new();
        let mut claimed = BTreeSet::new();
        for config in inner.iter_mut() {
            if !in_folder(config, &from_segments) {
                continue;
            }
            let tail = config.name.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>()
                [from_segments.len()..]
                .join("/");
            let new_name = if to.is_empty() {
                tail
            } else {
                format!("{}/{}", to, tail)
            };
            if taken.contains(&new_name) || !claimed.insert(new_name.clone()) {
                continue;
            }
            moved.push(config.clone());
            config.name = new_name;
        }

        if moved.is_empty() {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Ok(0);
        }

        inner.sort_by(|a, b| a.name.cmp(&b.name));
        self.commit(&mut inner, previous)?;
        drop(inner);

        for old in &moved {
            self.manager.close_pool(old);
        }
        self.notify_overwritten(overwritten);
        self.notify(|l| l.pref_change());
        Ok(moved.len())
    }

    /// Remove every server in a folder (including subfolders), returning
    /// the count removed.
    pub fn remove_folder(&self, folder: &str) -> Result<usize> {
        let folder = clean_folder_name(folder);
        if folder.is_empty() {
            return Ok(0);
        }
        let segments: Vec<&str> = folder.split('/').collect();

        let mut inner = self.inner.lock().unwrap();
        let overwritten = self.reconcile(&mut inner);
        let previous = inner.clone();

        let mut removed = Vec::new();
        inner.retain(|config| {
            if in_folder(config, &segments) {
                removed.push(config.clone());
                false
            } else {
                true
            }
        });

        if removed.is_empty() {
            drop(inner);
            self.notify_overwritten(overwritten);
            return Ok(0);
        }

        self.commit(&mut inner, previous)?;
        drop(inner);

        for config in &removed {
            self.manager.close_pool(config);
        }
        self.notify_overwritten(overwritten);
        self.notify(|l| l.pref_change());
        Ok(removed.len())
    }

    /// Look up a server by its full name.
    pub fn get(&self, name: &str) -> Option<ServerConfig> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// All servers, sorted by name.
    pub fn list_all(&self) -> Vec<ServerConfig> {
        self.inner.lock().unwrap().clone()
    }

    /// Every folder path in use, including intermediate prefixes, sorted.
    pub fn list_folders(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut folders = BTreeSet::new();
        for config in inner.iter() {
            let path = config.folder_path();
            for depth in 1..=path.len() {
                folders.insert(path[..depth].join("/"));
            }
        }
        folders.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload the persisted list and let it win over local memory when the
    /// two differ. Returns whether memory was overwritten.
    fn reconcile(&self, inner: &mut MutexGuard<'_, Vec<ServerConfig>>) -> bool {
        match codec::load_servers(self.store.as_ref()) {
            Ok(Some(mut persisted)) => {
                persisted.sort_by(|a, b| a.name.cmp(&b.name));
                if persisted != **inner {
                    **inner = persisted;
                    true
                } else {
                    false
                }
            }
            Ok(None) => false,
            Err(e) => {
                warn!("ignoring corrupt saved server list: {}", e);
                false
            }
        }
    }

    /// Persist the mutated list. Capacity errors roll the mutation back
    /// and propagate; other store errors are logged and the in-memory
    /// change stands.
    fn commit(
        &self,
        inner: &mut MutexGuard<'_, Vec<ServerConfig>>,
        previous: Vec<ServerConfig>,
    ) -> Result<()> {
        match codec::save_servers(self.store.as_ref(), inner) {
            Ok(()) => Ok(()),
            Err(e @ QdeskError::Capacity(_)) => {
                **inner = previous;
                Err(e)
            }
            Err(e) => {
                warn!("failed to persist server list: {}", e);
                Ok(())
            }
        }
    }

    fn notify_overwritten(&self, overwritten: bool) {
        if overwritten {
            self.notify(|l| l.list_overwritten());
        }
    }

    fn notify(&self, f: impl Fn(&dyn RegistryListener)) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("registry listener panicked");
            }
        }
    }
}

fn in_folder(config: &ServerConfig, segments: &[&str]) -> bool {
    let path = config.folder_path();
    path.len() >= segments.len() && path.iter().zip(segments).all(|(a, b)| a == b)
}
