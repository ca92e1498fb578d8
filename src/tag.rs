//! `agentation tag`: run the locator over files and directories.
//!
//! With a single file and no output directory, the transformed text goes to
//! stdout. Otherwise every walked file is mirrored under `--out-dir` at its
//! root-relative path: tagged files rewritten, everything else copied
//! verbatim, so the output tree is complete.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::Config;
use crate::locator::{BuildMode, Locator};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TagSummary {
    pub tagged: usize,
    pub passed_through: usize,
}

pub struct TagOptions {
    pub paths: Vec<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub source_map: bool,
    pub mode: BuildMode,
}

pub fn run_tag(config: &Config, opts: &TagOptions) -> Result<TagSummary> {
    let locator = Locator::new(&config.locator)?;

    if opts.paths.is_empty() {
        bail!("no input paths given");
    }

    let Some(out_dir) = opts.out_dir.as_deref() else {
        if opts.paths.len() != 1 || !opts.paths[0].is_file() {
            bail!("--out-dir is required unless a single file is given");
        }
        return tag_to_stdout(&locator, &opts.paths[0], opts.mode);
    };

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let out_root = absolute(out_dir);

    let mut summary = TagSummary::default();
    for input in &opts.paths {
        // Output from earlier runs may sit inside an input tree.
        let walker = WalkDir::new(input)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && absolute(e.path()) == out_root));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = absolute(entry.path());
            let relative = locator.relative_path(&path);
            let dest = out_dir.join(relative.trim_start_matches('/'));
            tag_file(&locator, &path, &dest, opts, &mut summary)?;
        }
    }

    println!(
        "tagged: {}, passed through: {}",
        summary.tagged, summary.passed_through
    );
    Ok(summary)
}

fn tag_to_stdout(locator: &Locator, path: &Path, mode: BuildMode) -> Result<TagSummary> {
    let path = absolute(path);
    let code = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let (text, summary) = match locator.transform(&code, &path, mode) {
        Some(output) => (
            output.code,
            TagSummary {
                tagged: 1,
                passed_through: 0,
            },
        ),
        None => (
            code,
            TagSummary {
                tagged: 0,
                passed_through: 1,
            },
        ),
    };
    std::io::stdout().write_all(text.as_bytes())?;
    Ok(summary)
}

fn tag_file(
    locator: &Locator,
    path: &Path,
    dest: &Path,
    opts: &TagOptions,
    summary: &mut TagSummary,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let transformed = if locator.accepts(path) {
        match std::fs::read_to_string(path) {
            Ok(code) => locator.transform(&code, path, opts.mode),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable source; copying as-is");
                None
            }
        }
    } else {
        None
    };

    match transformed {
        Some(output) => {
            std::fs::write(dest, &output.code)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            if opts.source_map {
                let mut map_path = dest.as_os_str().to_owned();
                map_path.push(".map");
                std::fs::write(PathBuf::from(map_path), output.map_json()?)?;
            }
            summary.tagged += 1;
        }
        None => {
            std::fs::copy(path, dest)
                .with_context(|| format!("Failed to copy {}", path.display()))?;
            summary.passed_through += 1;
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
