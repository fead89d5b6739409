use std::path::{Path, PathBuf};

/// Directory holding a user's sandboxes: `<root>/<user>/sandboxes`.
const SANDBOXES_DIR: &str = "sandboxes";

/// Directory holding a user's main project workspaces: `<root>/<user>/projects`.
const PROJECTS_DIR: &str = "projects";

/// On-disk layout of the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user(&self, user_id: &str) -> PathBuf {
        self.root.join(user_id)
    }

    pub fn sandboxes(&self, user_id: &str) -> PathBuf {
        self.user(user_id).join(SANDBOXES_DIR)
    }

    /// Sandbox directory: `<root>/<user>/sandboxes/<id>`.
    pub fn sandbox(&self, user_id: &str, sandbox_id: &str) -> PathBuf {
        self.sandboxes(user_id).join(sandbox_id)
    }

    /// Main project workspace: `<root>/<user>/projects/<project>`.
    pub fn project(&self, user_id: &str, project_id: &str) -> PathBuf {
        self.user(user_id).join(PROJECTS_DIR).join(project_id)
    }
}

/// Sibling path a pre-existing directory is moved aside to:
/// `<path>.backup.<epoch-ms>`.
pub fn backup_path(path: &Path, epoch_ms: i64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".backup.{epoch_ms}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_layout() {
        let paths = WorkspacePaths::new(PathBuf::from("/ws"));
        assert_eq!(
            paths.sandbox("u1", "sbx-1"),
            PathBuf::from("/ws/u1/sandboxes/sbx-1")
        );
        assert_eq!(paths.sandboxes("u1"), PathBuf::from("/ws/u1/sandboxes"));
    }

    #[test]
    fn project_layout() {
        let paths = WorkspacePaths::new(PathBuf::from("/ws"));
        assert_eq!(
            paths.project("u1", "calc"),
            PathBuf::from("/ws/u1/projects/calc")
        );
    }

    #[test]
    fn backup_path_appends_timestamp() {
        let backup = backup_path(Path::new("/ws/u1/projects/calc"), 1_700_000_000_123);
        assert_eq!(
            backup,
            PathBuf::from("/ws/u1/projects/calc.backup.1700000000123")
        );
    }
}
