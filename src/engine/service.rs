// Clawdbot Gateway — Service PATH Policy
//
// When the gateway runs as a service, its PATH is reduced to a fixed,
// predictable list: one discovered interpreter-binary directory,
// optional explicit extras, then /usr/local/bin, /usr/bin, /bin —
// de-duplicated, in exactly that order.

use std::path::PathBuf;

const SYSTEM_DIRS: [&str; 3] = ["/usr/local/bin", "/usr/bin", "/bin"];

/// Build the sanitized PATH value for service execution.
pub fn build_service_path(interpreter_dir: Option<&str>, extras: &[String]) -> String {
    let mut ordered: Vec<String> = Vec::new();
    if let Some(dir) = interpreter_dir {
        if !dir.is_empty() {
            ordered.push(dir.to_string());
        }
    }
    ordered.extend(extras.iter().filter(|e| !e.is_empty()).cloned());
    ordered.extend(SYSTEM_DIRS.iter().map(|s| s.to_string()));

    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<String> = ordered.into_iter().filter(|p| seen.insert(p.clone())).collect();
    deduped.join(":")
}

/// Directory of the interpreter binary running this process, if it can
/// be discovered.
pub fn current_interpreter_dir() -> Option<String> {
    std::env::current_exe()
        .ok()
        .and_then(|p: PathBuf| p.parent().map(|d| d.to_string_lossy().into_owned()))
}
