use std::path::Path;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::key::SyncableKey;
use super::paths::key_for_path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed(SyncableKey),
    Removed(SyncableKey),
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let mut out = Vec::new();
            if let Some(from) = key_for_path(root, &event.paths[0]) {
                out.push(LocalEvent::Removed(from));
            }
            if let Some(to) = key_for_path(root, &event.paths[1]) {
                out.push(LocalEvent::Changed(to));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => keys(root, event.paths)
            .map(LocalEvent::Removed)
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Create(CreateKind::Folder)
        | EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Create(_) | EventKind::Modify(_) => keys(root, event.paths)
            .map(LocalEvent::Changed)
            .collect(),
        EventKind::Remove(_) => keys(root, event.paths)
            .map(LocalEvent::Removed)
            .collect(),
        _ => Vec::new(),
    }
}

fn keys(root: &Path, paths: Vec<std::path::PathBuf>) -> impl Iterator<Item = SyncableKey> + '_ {
    paths
        .into_iter()
        .filter_map(move |path| key_for_path(root, &path))
}
