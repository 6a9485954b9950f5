use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::debug;

use super::{ChangedPath, Language, SourceLister, VcsError};

/// A local git checkout driven through the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VcsError> {
        let repo = Self {
            root: root.as_ref().to_path_buf(),
        };
        repo.git(&["rev-parse", "--git-dir"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First-parent history of HEAD, oldest first.
    pub fn first_parent_history(&self) -> Result<Vec<String>, VcsError> {
        let out = self.git(&["rev-list", "--reverse", "--first-parent", "HEAD"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    pub fn file_at(&self, revision: &str, path: &str) -> Result<String, VcsError> {
        self.git(&["show", &format!("{revision}:{path}")])
    }

    fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let command = format!("git {}", args.join(" "));
        debug!(%command, "running git");
        let output = ProcessCommand::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(VcsError::Spawn)?;
        if !output.status.success() {
            return Err(VcsError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| VcsError::Utf8 { command })
    }
}

impl SourceLister for GitRepository {
    fn list_source_files(
        &self,
        revision: &str,
        language: &Language,
    ) -> Result<Vec<String>, VcsError> {
        let out = self.git(&["ls-tree", "-r", "--name-only", revision])?;
        Ok(out
            .lines()
            .filter(|path| language.is_target(path))
            .map(ToOwned::to_owned)
            .collect())
    }

    fn changed_paths(&self, revision: &str) -> Result<Vec<ChangedPath>, VcsError> {
        let out = self.git(&[
            "diff-tree",
            "--no-commit-id",
            "--name-status",
            "-r",
            "--root",
            revision,
        ])?;
        Ok(parse_name_status(&out))
    }
}

/// Parses `--name-status` output. A rename `R100\told\tnew` is reported as a
/// deletion of the old path plus an addition of the new one.
fn parse_name_status(output: &str) -> Vec<ChangedPath> {
    let mut out = Vec::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(status), Some(path)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some(code) = status.chars().next() else {
            continue;
        };
        match (code, fields.next()) {
            ('R', Some(renamed)) => {
                out.push(ChangedPath {
                    path: path.to_string(),
                    code: 'D',
                });
                out.push(ChangedPath {
                    path: renamed.to_string(),
                    code: 'A',
                });
            }
            ('C', Some(copied)) => out.push(ChangedPath {
                path: copied.to_string(),
                code: 'A',
            }),
            _ => out.push(ChangedPath {
                path: path.to_string(),
                code,
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_status_lines_become_changed_paths() {
        let parsed = parse_name_status("M\tsrc/a.c\nA\tsrc/b.c\nR087\tsrc/c.c\tsrc/d.c\n\n");
        let codes = parsed
            .iter()
            .map(|changed| (changed.path.as_str(), changed.code))
            .collect::<Vec<_>>();
        assert_eq!(
            codes,
            vec![
                ("src/a.c", 'M'),
                ("src/b.c", 'A'),
                ("src/c.c", 'D'),
                ("src/d.c", 'A'),
            ]
        );
    }
}
