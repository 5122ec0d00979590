//! Filesystem watch mode: a `notify-debouncer-full` watcher over the
//! project root that recompiles the whole project once per debounced
//! batch of changes, rather than maintaining an incremental per-file
//! reparse queue, with a single callback instead of a background compiler
//! thread plus work notifier.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use parking_lot::Mutex;

use crate::error::TypedownError;
use crate::project::{CompileOptions, CompileResult, Compiler};

/// Matches the LSP's debounce window (both settled on 500ms).
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Owns the live debouncer; dropping it stops the watch.
pub struct WatchHandle {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

fn is_relevant(path: &std::path::Path) -> bool {
    let is_dotfile = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    if is_dotfile {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| crate::SOURCE_EXTENSIONS.contains(&ext) || path.ends_with(crate::PROJECT_FILE))
}

/// Watches `compiler`'s project root and invokes `on_compile` with a fresh
/// `CompileResult` each time a debounced batch contains at least one
/// relevant source or config file change.
pub fn watch_project(
    compiler: Arc<Mutex<Compiler>>,
    on_compile: impl Fn(&CompileResult) + Send + Sync + 'static,
) -> Result<WatchHandle, TypedownError> {
    let root = compiler.lock().root().to_path_buf();
    let on_compile = Arc::new(on_compile);

    let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let relevant: Vec<PathBuf> = events
                    .iter()
                    .filter(|e| {
                        matches!(
                            e.event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        )
                    })
                    .flat_map(|e| e.paths.iter().cloned())
                    .filter(|p| is_relevant(p))
                    .collect();

                if relevant.is_empty() {
                    return;
                }
                tracing::info!(count = relevant.len(), "watch: recompiling whole project");

                let compiler = compiler.lock();
                let result = compiler.compile(&CompileOptions::default());
                on_compile(&result);
            }
            Err(errors) => {
                for error in errors {
                    tracing::error!("watch: notify error: {error}");
                }
            }
        }
    })
    .map_err(|e| TypedownError::Internal(format!("failed to start file watcher: {e}")))?;

    debouncer
        .watcher()
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| TypedownError::Internal(format!("failed to watch {}: {e}", root.display())))?;

    Ok(WatchHandle {
        _debouncer: debouncer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relevant_filters_dotfiles_and_unknown_extensions() {
        assert!(is_relevant(std::path::Path::new("entities/alice.td")));
        assert!(is_relevant(std::path::Path::new("models/user.md")));
        assert!(!is_relevant(std::path::Path::new(".hidden.td")));
        assert!(!is_relevant(std::path::Path::new("notes.txt")));
    }

    #[test]
    fn relevant_accepts_project_file() {
        assert!(is_relevant(std::path::Path::new("typedown.toml")));
    }
}
