//! Build contexts.
//!
//! A build context is a named, directory-rooted file tree filtered by a
//! `.dockerignore`-style pattern list. Contexts are walked in a
//! deterministic order to compute a content hash and to stream a tar
//! archive to the builder. An optional umask rewrites permission bits so
//! the hash is stable across developers with different group/other modes.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use tar::{Builder as TarBuilder, EntryType, Header};

use crate::error::{Result, TplError};
use crate::hashing::{self, RollingHash};

/// One `.dockerignore`-style pattern compiled to a path regex.
#[derive(Debug, Clone)]
pub struct ContextPattern {
    /// True if matching this pattern ignores the path, false if it
    /// re-includes it (`!pattern`).
    pub ignoring: bool,
    regex: Regex,
    source: String,
}

impl ContextPattern {
    /// Compile a single dockerignore pattern. Negated patterns also match
    /// any parent-directory prefix so that re-included files are reachable
    /// through their otherwise-ignored parents.
    pub fn new(pattern: &str) -> Result<Self> {
        let (ignoring, body) = match pattern.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, pattern),
        };
        let regex_src = translate_pattern(body, !ignoring, true)
            .map_err(|reason| TplError::context(format!("pattern {pattern:?}: {reason}")))?;
        let regex = Regex::new(&regex_src)
            .map_err(|err| TplError::context(format!("pattern {pattern:?}: {err}")))?;
        Ok(Self {
            ignoring,
            regex,
            source: pattern.to_string(),
        })
    }

    /// Returns true if this pattern matches `path`. Paths start with `/`
    /// and are relative to the context root.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The original pattern text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Translate one path component of a dockerignore pattern into regex text.
/// Returns the regex fragment and whether the component is "simple"
/// (matches only a single literal name).
fn translate_part(part: &str, allow_double_star: bool) -> std::result::Result<(String, bool), String> {
    if part == "**" && allow_double_star {
        // Any number of whole path components; must not eat partial
        // component names, so `a/**/b` rejects `/abc/b`.
        return Ok(("(?:/[^/]+)*".to_string(), false));
    }

    let mut out = String::from("/");
    let mut simple = true;
    let mut chars = part.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(esc) => out.push_str(&regex::escape(&esc.to_string())),
                None => return Err("trailing escape character".to_string()),
            },
            '*' => {
                simple = false;
                out.push_str("[^/]*");
            }
            '?' => {
                simple = false;
                out.push_str("[^/]");
            }
            '[' => {
                simple = false;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    out.push('^');
                    chars.next();
                }
                let mut empty = true;
                let mut char_avail = false;
                let mut in_range = false;
                loop {
                    let Some(mut ch) = chars.next() else {
                        return Err("unclosed character class".to_string());
                    };
                    if ch == '\\' {
                        ch = chars
                            .next()
                            .ok_or_else(|| "trailing escape character".to_string())?;
                    } else if ch == ']' {
                        if in_range {
                            return Err("unclosed character range".to_string());
                        }
                        if empty {
                            return Err("empty character class".to_string());
                        }
                        break;
                    } else if ch == '-' {
                        if !char_avail {
                            return Err("unexpected '-' in character class".to_string());
                        }
                        out.push('-');
                        in_range = true;
                        char_avail = false;
                        continue;
                    }
                    in_range = false;
                    char_avail = true;
                    empty = false;
                    out.push_str(&regex::escape(&ch.to_string()));
                }
                out.push(']');
            }
            _ => out.push_str(&regex::escape(&ch.to_string())),
        }
    }

    Ok((out, simple))
}

/// Compile a full pattern with `/` separators into an anchored regex.
///
/// With `match_prefix` set (negated patterns) and a pattern whose leading
/// components are all simple, any path matching a prefix of the components
/// also matches, so `!a/b/*.txt` keeps `a` and `a/b` in the context.
fn translate_pattern(
    pattern: &str,
    match_prefix: bool,
    allow_double_star: bool,
) -> std::result::Result<String, String> {
    let parts: Vec<(String, bool)> = pattern
        .trim_matches('/')
        .split('/')
        .map(|p| translate_part(p, allow_double_star))
        .collect::<std::result::Result<_, _>>()?;

    let all_simple_prefix = parts[..parts.len().saturating_sub(1)]
        .iter()
        .all(|(_, simple)| *simple);
    if !match_prefix || !all_simple_prefix {
        let body: String = parts.iter().map(|(p, _)| p.as_str()).collect();
        return Ok(format!("^{body}(?:$|/)"));
    }

    let mut out = String::from("^");
    for (part, _) in &parts {
        out.push_str(part);
        out.push_str("(?:$|");
    }
    out.push('/');
    out.push_str(&")".repeat(parts.len()));
    Ok(out)
}

/// Apply umask semantics: copy the owner permission bits to group/other,
/// then clear any bits set in the umask. A `None` umask preserves the raw
/// mode bits.
pub fn apply_umask(mode: u32, umask: Option<u32>) -> u32 {
    match umask {
        None => mode,
        Some(umask) => {
            let owner = (mode >> 6) & 0o7;
            (mode & !0o777) | (((owner << 6) | (owner << 3) | owner) & !umask)
        }
    }
}

/// Kind of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

impl EntryKind {
    fn label(&self) -> &'static str {
        match self {
            EntryKind::Dir => "dir",
            EntryKind::File => "file",
            EntryKind::Symlink => "symlink",
        }
    }
}

/// One filesystem object in a walked context, in archive form: `path`
/// starts with `/` and is relative to the context root.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub link_target: Option<String>,
}

/// A named, ignore-filtered build context rooted at a directory.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub name: String,
    base_dir: Option<PathBuf>,
    umask: Option<u32>,
    patterns: Vec<ContextPattern>,
}

impl BuildContext {
    pub fn new(
        name: impl Into<String>,
        base_dir: Option<PathBuf>,
        umask: Option<u32>,
        ignore_patterns: &[String],
    ) -> Result<Self> {
        let patterns = ignore_patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty() && !p.starts_with('#'))
            .map(ContextPattern::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            base_dir,
            umask,
            patterns,
        })
    }

    /// An empty context with no file tree, used when a build needs no
    /// COPY sources.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_dir: None,
            umask: None,
            patterns: Vec::new(),
        }
    }

    /// Returns true if `path` (starting with `/`, relative to the context
    /// root) is excluded. The last matching pattern wins.
    pub fn ignored(&self, path: &str) -> bool {
        let mut ignored = false;
        for pattern in &self.patterns {
            if pattern.ignoring == ignored {
                continue;
            }
            if pattern.matches(path) {
                ignored = pattern.ignoring;
            }
        }
        ignored
    }

    /// Walk the context in deterministic (lexicographic) order, skipping
    /// ignored paths. Ignored directories are pruned without descending.
    pub fn walk(&self) -> Result<Vec<ContextEntry>> {
        let mut entries = Vec::new();
        let Some(base_dir) = &self.base_dir else {
            entries.push(ContextEntry {
                path: "/".to_string(),
                kind: EntryKind::Dir,
                mode: apply_umask(0o777, self.umask),
                size: 0,
                link_target: None,
            });
            return Ok(entries);
        };

        if !base_dir.is_dir() {
            return Err(TplError::context(format!(
                "context {:?}: base directory {} does not exist",
                self.name,
                base_dir.display()
            )));
        }

        self.walk_dir(base_dir, "", &mut entries)?;
        Ok(entries)
    }

    fn walk_dir(&self, dir: &Path, rel: &str, out: &mut Vec<ContextEntry>) -> Result<()> {
        let meta = fs::metadata(dir).map_err(|e| TplError::io(dir, e))?;
        out.push(ContextEntry {
            path: if rel.is_empty() {
                "/".to_string()
            } else {
                rel.to_string()
            },
            kind: EntryKind::Dir,
            mode: apply_umask(meta.mode(), self.umask),
            size: 0,
            link_target: None,
        });

        let mut names: Vec<(String, PathBuf)> = fs::read_dir(dir)
            .map_err(|e| TplError::io(dir, e))?
            .map(|entry| {
                let entry = entry.map_err(|e| TplError::io(dir, e))?;
                Ok((entry.file_name().to_string_lossy().into_owned(), entry.path()))
            })
            .collect::<Result<_>>()?;
        names.sort();

        let mut subdirs = Vec::new();
        for (name, path) in names {
            let rel_path = format!("{rel}/{name}");
            if self.ignored(&rel_path) {
                continue;
            }
            let meta = fs::symlink_metadata(&path).map_err(|e| TplError::io(&path, e))?;
            if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).map_err(|e| TplError::io(&path, e))?;
                out.push(ContextEntry {
                    path: rel_path,
                    kind: EntryKind::Symlink,
                    mode: apply_umask(0o777, self.umask),
                    size: 0,
                    link_target: Some(target.to_string_lossy().into_owned()),
                });
            } else if meta.is_dir() {
                subdirs.push((rel_path, path));
            } else if meta.is_file() {
                out.push(ContextEntry {
                    path: rel_path,
                    kind: EntryKind::File,
                    mode: apply_umask(meta.mode(), self.umask),
                    size: meta.len(),
                    link_target: None,
                });
            } else {
                return Err(TplError::context(format!(
                    "context {:?}: unsupported file type at {}",
                    self.name,
                    path.display()
                )));
            }
        }

        for (rel_path, path) in subdirs {
            self.walk_dir(&path, &rel_path, out)?;
        }
        Ok(())
    }

    /// Full content hash of the filtered file tree: every entry's
    /// metadata plus file content digests, folded into one digest.
    pub fn files_hash(&self) -> Result<String> {
        let mut rolling = RollingHash::new();
        for entry in self.walk()? {
            let payload = (
                entry.path.as_str(),
                entry.kind.label(),
                entry.mode,
                entry.size,
                entry.link_target.as_deref().unwrap_or(""),
            );
            rolling.update(hashing::json_hash(&payload));
            if entry.kind == EntryKind::File {
                rolling.update(hashing::file_hash(&self.entry_source(&entry.path))?);
            }
        }
        Ok(hashing::json_hash(&("context-files", rolling.finish())))
    }

    /// Hash of the parameters defining the context, without reading any
    /// file content.
    pub fn symbolic_hash(&self) -> String {
        let patterns: Vec<(bool, &str)> = self
            .patterns
            .iter()
            .map(|p| (p.ignoring, p.source()))
            .collect();
        hashing::json_hash(&(
            "context-symbolic",
            self.name.as_str(),
            self.umask,
            patterns,
        ))
    }

    /// Write the context as a tar stream, with `extra_files` injected at
    /// the archive root (used for the synthesized Dockerfile). Entries use
    /// uid/gid 0 and mtime 0 so archives are byte-stable.
    pub fn write_tar<W: Write>(
        &self,
        out: W,
        extra_files: &BTreeMap<String, (u32, Vec<u8>)>,
        compress: bool,
    ) -> Result<()> {
        if compress {
            let encoder = GzEncoder::new(out, Compression::default());
            let encoder = self.write_tar_inner(encoder, extra_files)?;
            encoder
                .finish()
                .map_err(|e| TplError::context(format!("writing context tar: {e}")))?;
            Ok(())
        } else {
            self.write_tar_inner(out, extra_files)?;
            Ok(())
        }
    }

    fn write_tar_inner<W: Write>(
        &self,
        out: W,
        extra_files: &BTreeMap<String, (u32, Vec<u8>)>,
    ) -> Result<W> {
        let io_err = |e: std::io::Error| TplError::context(format!("writing context tar: {e}"));
        let mut builder = TarBuilder::new(out);

        for entry in self.walk()? {
            let mut header = Header::new_gnu();
            header.set_mode(entry.mode & 0o7777);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            let name = entry.path.trim_start_matches('/');
            let name = if name.is_empty() { "." } else { name };
            match entry.kind {
                EntryKind::Dir => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, format!("{name}/"), std::io::empty())
                        .map_err(io_err)?;
                }
                EntryKind::Symlink => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    builder
                        .append_link(
                            &mut header,
                            name,
                            entry.link_target.as_deref().unwrap_or(""),
                        )
                        .map_err(io_err)?;
                }
                EntryKind::File => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(entry.size);
                    let source = self.entry_source(&entry.path);
                    let file = fs::File::open(&source).map_err(|e| TplError::io(&source, e))?;
                    builder.append_data(&mut header, name, file).map_err(io_err)?;
                }
            }
        }

        for (name, (mode, data)) in extra_files {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(apply_umask(*mode, self.umask) & 0o7777);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_size(data.len() as u64);
            builder
                .append_data(&mut header, name, data.as_slice())
                .map_err(io_err)?;
        }

        builder.into_inner().map_err(io_err)
    }

    /// Serialize the whole context (plus extra files) into memory.
    pub fn tar_bytes(&self, extra_files: &BTreeMap<String, (u32, Vec<u8>)>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_tar(&mut buf, extra_files, false)?;
        Ok(buf)
    }

    fn entry_source(&self, rel_path: &str) -> PathBuf {
        self.base_dir
            .as_deref()
            .expect("file entries only exist with a base_dir")
            .join(rel_path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn context(dir: &Path, patterns: &[&str]) -> BuildContext {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        BuildContext::new("default", Some(dir.to_path_buf()), Some(0o022), &patterns).unwrap()
    }

    #[test]
    fn test_apply_umask() {
        // Owner bits are copied to group/other before masking.
        assert_eq!(apply_umask(0o700, Some(0o022)), 0o755);
        assert_eq!(apply_umask(0o600, Some(0o022)), 0o644);
        assert_eq!(apply_umask(0o640, Some(0o077)), 0o600);
        assert_eq!(apply_umask(0o123, None), 0o123);
    }

    #[test]
    fn test_ignore_last_match_wins() {
        let ctx = BuildContext::new(
            "default",
            None,
            None,
            &["*.log".into(), "!keep.log".into()],
        )
        .unwrap();
        assert!(ctx.ignored("/build.log"));
        assert!(!ctx.ignored("/keep.log"));
        assert!(!ctx.ignored("/src/main.rs"));
    }

    #[test]
    fn test_star_matches_path_prefix() {
        let ctx = BuildContext::new("default", None, None, &["*".into(), "!keep".into()]).unwrap();
        assert!(ctx.ignored("/a"));
        assert!(ctx.ignored("/sub"));
        assert!(ctx.ignored("/sub/keep"));
        assert!(!ctx.ignored("/keep"));
        assert!(!ctx.ignored("/keep/nested"));
    }

    #[test]
    fn test_double_star_pattern() {
        let ctx =
            BuildContext::new("default", None, None, &["**/node_modules".into()]).unwrap();
        assert!(ctx.ignored("/node_modules"));
        assert!(ctx.ignored("/a/b/node_modules"));
        assert!(ctx.ignored("/a/node_modules/pkg"));
        assert!(!ctx.ignored("/a/node_modules_backup"));
    }

    #[test]
    fn test_double_star_mid_pattern_matches_whole_components() {
        let ctx = BuildContext::new("default", None, None, &["a/**/b".into()]).unwrap();
        assert!(ctx.ignored("/a/b"));
        assert!(ctx.ignored("/a/x/b"));
        assert!(ctx.ignored("/a/x/y/b"));
        assert!(ctx.ignored("/a/b/nested"));
        // "abc" is one component, not "a" followed by more components.
        assert!(!ctx.ignored("/abc/b"));
        assert!(!ctx.ignored("/a/bc"));
    }

    #[test]
    fn test_question_mark_matches_exactly_one_char() {
        let ctx = BuildContext::new("default", None, None, &["file?.txt".into()]).unwrap();
        assert!(ctx.ignored("/file1.txt"));
        assert!(ctx.ignored("/fileA.txt"));
        assert!(!ctx.ignored("/file.txt"));
        assert!(!ctx.ignored("/file12.txt"));
        assert!(!ctx.ignored("/file1/txt"));
    }

    #[test]
    fn test_character_class_pattern() {
        let ctx = BuildContext::new("default", None, None, &["file[0-9].txt".into()]).unwrap();
        assert!(ctx.ignored("/file1.txt"));
        assert!(!ctx.ignored("/fileA.txt"));

        let err = BuildContext::new("default", None, None, &["file[0-".into()]).unwrap_err();
        assert!(matches!(err, TplError::Context { .. }));
    }

    #[test]
    fn test_negated_prefix_keeps_parents() {
        // "!a/b/*.txt" must keep "a" and "a/b" so the kept files remain
        // reachable through the directory walk.
        let ctx = BuildContext::new(
            "default",
            None,
            None,
            &["*".into(), "!a/b/*.txt".into()],
        )
        .unwrap();
        assert!(!ctx.ignored("/a"));
        assert!(!ctx.ignored("/a/b"));
        assert!(!ctx.ignored("/a/b/notes.txt"));
        assert!(ctx.ignored("/a/b/notes.bin"));
        assert!(ctx.ignored("/c"));
    }

    #[test]
    fn test_walk_deterministic_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();
        std::fs::write(dir.path().join("skip.log"), b"x").unwrap();
        symlink("a.txt", dir.path().join("link")).unwrap();

        let ctx = context(dir.path(), &["*.log"]);
        let paths: Vec<String> = ctx.walk().unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(
            paths,
            vec!["/", "/a.txt", "/b.txt", "/link", "/sub", "/sub/c.txt"]
        );
    }

    #[test]
    fn test_files_hash_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep"), b"one").unwrap();
        std::fs::write(dir.path().join("noise.log"), b"aaa").unwrap();

        let ctx = context(dir.path(), &["*.log"]);
        let before = ctx.files_hash().unwrap();

        // Changing an ignored file leaves the hash untouched.
        std::fs::write(dir.path().join("noise.log"), b"bbb").unwrap();
        assert_eq!(ctx.files_hash().unwrap(), before);

        // Changing a tracked file's content changes it.
        std::fs::write(dir.path().join("keep"), b"two").unwrap();
        assert_ne!(ctx.files_hash().unwrap(), before);
    }

    #[test]
    fn test_files_hash_stable_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let a = context(dir.path(), &[]).files_hash().unwrap();
        let b = context(dir.path(), &[]).files_hash().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_base_dir_fails() {
        let ctx = BuildContext::new(
            "default",
            Some(PathBuf::from("/nonexistent/tplbuild-test")),
            None,
            &[],
        )
        .unwrap();
        assert!(matches!(ctx.walk(), Err(TplError::Context { .. })));
    }

    #[test]
    fn test_tar_bytes_stable_and_includes_extra_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), b"print('hi')\n").unwrap();

        let ctx = context(dir.path(), &[]);
        let mut extra = BTreeMap::new();
        extra.insert(
            "Dockerfile".to_string(),
            (0o444u32, b"FROM alpine\n".to_vec()),
        );

        let first = ctx.tar_bytes(&extra).unwrap();
        let second = ctx.tar_bytes(&extra).unwrap();
        assert_eq!(first, second);

        let mut archive = tar::Archive::new(first.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n == "app.py"));
        assert!(names.iter().any(|n| n == "Dockerfile"));
    }
}
