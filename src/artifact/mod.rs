//! Files seeded into scenarios and the source/builder drivers that
//! fetch and compile client programs.
//!
//! A [`FileObject`] is data placed on hosts for clients to serve or
//! fetch. The shared machinery — meta files, root hashes, the on-host
//! directory scheme — lives here; where the data comes from is
//! answered by a [`FilePlugin`]. [`SourceDriver`] and [`BuilderDriver`]
//! are the client-side counterparts for program code.

pub mod builder;
pub mod fakedata;
pub mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{AppError, AppResult, ConfigError, StageError};
use crate::host::{Host, Reuse};

pub use builder::BuilderDriver;
pub use source::SourceDriver;

/// Behavior of one file subtype.
///
/// The plugin sees the shared [`FileCommon`] for the name, meta file
/// and root hashes; staging goes through the owning object so all
/// subtypes share one directory scheme on the host.
#[async_trait]
pub trait FilePlugin: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Parse one subtype-specific setting. Returns false when the key
    /// is not one of this plugin's.
    ///
    /// # Errors
    ///
    /// Fails when the key is recognized but the value is not usable.
    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool>;

    /// Validate the collected settings. Generated meta files and root
    /// hashes are written into `common` here.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    fn check_settings(&mut self, common: &mut FileCommon) -> AppResult<()>;

    /// Subtype hook run when the file is announced to any host that
    /// takes part in the scenario.
    ///
    /// # Errors
    ///
    /// Fails when the host cannot be set up for this file.
    async fn stage_host(&self, common: &FileCommon, host: &Host) -> AppResult<()> {
        let _ = (common, host);
        Ok(())
    }

    /// Subtype hook run on hosts that seed the file. The data itself
    /// is put in place here.
    ///
    /// # Errors
    ///
    /// Fails when the data cannot be placed on the host.
    async fn stage_seeding_host(&self, common: &FileCommon, host: &Host) -> AppResult<()> {
        let _ = (common, host);
        Ok(())
    }

    /// Where the seeded data lives on `host`, or `None` when the
    /// subtype stages no data.
    ///
    /// # Errors
    ///
    /// Fails when the host has no usable data directory yet.
    fn remote_data_path(&self, common: &FileCommon, host: &Host) -> AppResult<Option<String>> {
        let _ = (common, host);
        Ok(None)
    }

    /// Relative paths below [`remote_data_path`] when the staged data
    /// is a directory. Entries ending in `/` are directories. Empty
    /// means a single file.
    ///
    /// [`remote_data_path`]: FilePlugin::remote_data_path
    fn data_entries(&self) -> Vec<String> {
        Vec::new()
    }

    /// How many selectable variants this file has. `None` means the
    /// subtype does not support `name@argument` selection at all.
    fn variants(&self) -> Option<usize> {
        None
    }

    /// The plugin state and generated meta data for one variant.
    /// `None` when the subtype has no variants.
    fn select_variant(&self, index: usize) -> Option<VariantParts> {
        let _ = index;
        None
    }

    /// Remove local scratch data. Failures are logged, never raised.
    async fn cleanup(&self) {}
}

/// What a variant selection contributes on top of the base object.
pub struct VariantParts {
    pub plugin: Box<dyn FilePlugin>,
    pub meta_file: Option<PathBuf>,
    pub root_hashes: BTreeMap<u64, String>,
}

/// Settings shared by every file subtype.
pub struct FileCommon {
    pub(crate) name: String,
    pub(crate) meta_file: Option<PathBuf>,
    pub(crate) root_hashes: BTreeMap<u64, String>,
}

impl FileCommon {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn meta_file(&self) -> Option<&Path> {
        self.meta_file.as_deref()
    }

    #[must_use]
    pub const fn root_hashes(&self) -> &BTreeMap<u64, String> {
        &self.root_hashes
    }

    /// The directory on `host` under which this file keeps its data
    /// and meta files.
    ///
    /// # Errors
    ///
    /// Fails when the host has no reserved directory.
    pub fn file_dir(&self, host: &Host) -> AppResult<String> {
        Ok(format!("{}/files/{}", host.test_dir()?, self.name))
    }
}

/// One file taking part in scenarios.
pub struct FileObject {
    common: FileCommon,
    plugin: Box<dyn FilePlugin>,
}

impl FileObject {
    #[must_use]
    pub fn new(plugin: Box<dyn FilePlugin>) -> Self {
        Self {
            common: FileCommon {
                name: String::new(),
                meta_file: None,
                root_hashes: BTreeMap::new(),
            },
            plugin,
        }
    }

    /// Parse one `key=value` setting from a file section.
    ///
    /// # Errors
    ///
    /// Fails on unknown keys, duplicates and unusable values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<()> {
        if self.plugin.parse_setting(key, value)? {
            return Ok(());
        }
        match key {
            "name" => {
                if !self.common.name.is_empty() {
                    return Err(self.duplicate(key));
                }
                crate::config::syntax::validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.common.name = value.to_owned();
                Ok(())
            }
            "metaFile" => {
                if self.common.meta_file.is_some() {
                    return Err(self.duplicate(key));
                }
                let path = PathBuf::from(value);
                if !path.exists() {
                    return Err(AppError::stage(StageError::MetaFileMissing { path }));
                }
                self.common.meta_file = Some(path);
                Ok(())
            }
            "rootHash" => Err(AppError::stage(StageError::RootHashChunkSize {
                value: value.to_owned(),
            })),
            _ => {
                if let Some(spec) = key
                    .strip_prefix("rootHash[")
                    .and_then(|rest| rest.strip_suffix(']'))
                {
                    return self.parse_root_hash(key, spec, value);
                }
                Err(AppError::config(ConfigError::UnknownParameter {
                    section: self.section_label(),
                    key: key.to_owned(),
                }))
            }
        }
    }

    fn parse_root_hash(&mut self, key: &str, spec: &str, value: &str) -> AppResult<()> {
        let chunk_size = parse_chunk_size(spec).ok_or_else(|| {
            AppError::stage(StageError::RootHashChunkSizeSyntax {
                key: key.to_owned(),
                value: spec.to_owned(),
            })
        })?;
        if !crate::meta::is_root_hash(value) {
            return Err(AppError::stage(StageError::RootHashSyntax {
                value: value.to_owned(),
            }));
        }
        if self.common.root_hashes.contains_key(&chunk_size) {
            return Err(self.duplicate(key));
        }
        self.common.root_hashes.insert(chunk_size, value.to_owned());
        Ok(())
    }

    /// Validate the collected settings. Requested meta files and root
    /// hashes are generated here.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    pub fn check_settings(&mut self) -> AppResult<()> {
        if self.common.name.is_empty() {
            return Err(AppError::config(ConfigError::MissingParameter {
                section: self.section_label(),
                key: "name",
            }));
        }
        let Self { common, plugin } = self;
        plugin.check_settings(common)
    }

    fn section_label(&self) -> String {
        format!("file:{}", self.plugin.kind())
    }

    fn duplicate(&self, key: &str) -> AppError {
        AppError::config(ConfigError::DuplicateParameter {
            section: self.section_label(),
            key: key.to_owned(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.common.name
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.plugin.kind()
    }

    #[must_use]
    pub fn meta_file(&self) -> Option<&Path> {
        self.common.meta_file()
    }

    #[must_use]
    pub const fn root_hashes(&self) -> &BTreeMap<u64, String> {
        self.common.root_hashes()
    }

    #[must_use]
    pub fn root_hash(&self, chunk_size: u64) -> Option<&str> {
        self.common.root_hashes.get(&chunk_size).map(String::as_str)
    }

    /// The directory on `host` under which this file keeps its data
    /// and meta files.
    ///
    /// # Errors
    ///
    /// Fails when the host has no reserved directory.
    pub fn file_dir(&self, host: &Host) -> AppResult<String> {
        self.common.file_dir(host)
    }

    /// Where the meta file lives on `host`, or `None` when the file
    /// has no meta file. The original extension is kept so clients can
    /// tell torrents apart from other formats.
    ///
    /// # Errors
    ///
    /// Fails when the host has no usable data directory yet.
    pub fn remote_meta_path(&self, host: &Host) -> AppResult<Option<String>> {
        let Some(meta) = &self.common.meta_file else {
            return Ok(None);
        };
        let postfix = meta
            .extension()
            .map_or_else(String::new, |ext| format!(".{}", ext.to_string_lossy()));
        Ok(Some(format!(
            "{}/meta/meta_file{postfix}",
            self.common.file_dir(host)?
        )))
    }

    /// Where the seeded data lives on `host`, or `None` when the
    /// subtype stages no data.
    ///
    /// # Errors
    ///
    /// Fails when the host has no usable data directory yet.
    pub fn remote_data_path(&self, host: &Host) -> AppResult<Option<String>> {
        self.plugin.remote_data_path(&self.common, host)
    }

    /// Relative paths below [`remote_data_path`] when the staged data
    /// is a directory.
    ///
    /// [`remote_data_path`]: FileObject::remote_data_path
    #[must_use]
    pub fn data_entries(&self) -> Vec<String> {
        self.plugin.data_entries()
    }

    /// How many selectable variants this file has. `None` means
    /// `name@argument` selection is not supported.
    #[must_use]
    pub fn variants(&self) -> Option<usize> {
        self.plugin.variants()
    }

    /// A standalone object for one variant of this file. The variant's
    /// meta file and root hashes override the shared ones.
    ///
    /// # Errors
    ///
    /// Fails when the subtype does not support variant selection.
    pub fn materialize(&self, index: usize) -> AppResult<Self> {
        let parts = self.plugin.select_variant(index).ok_or_else(|| {
            AppError::config(ConfigError::SelectionUnsupported {
                kind: "file",
                name: self.common.name.clone(),
            })
        })?;
        let mut root_hashes = self.common.root_hashes.clone();
        root_hashes.extend(parts.root_hashes);
        let meta_file = parts.meta_file.or_else(|| self.common.meta_file.clone());
        Ok(Self {
            common: FileCommon {
                name: self.common.name.clone(),
                meta_file,
                root_hashes,
            },
            plugin: parts.plugin,
        })
    }

    /// Announce the file to a host: upload the meta file and run the
    /// subtype's staging hook.
    ///
    /// # Errors
    ///
    /// Fails when the upload or the subtype hook fails.
    pub async fn stage_host(&self, host: &Host) -> AppResult<()> {
        if let (Some(meta), Some(remote)) =
            (&self.common.meta_file, self.remote_meta_path(host)?)
        {
            let dir = self.common.file_dir(host)?;
            host.send_command(&format!("mkdir -p \"{dir}/meta/\""), &Reuse::Default)
                .await?;
            host.send_file(meta, &remote, false).await?;
        }
        self.plugin.stage_host(&self.common, host).await
    }

    /// Put the data itself on a host that seeds this file.
    ///
    /// # Errors
    ///
    /// Fails when the data cannot be placed on the host.
    pub async fn stage_seeding_host(&self, host: &Host) -> AppResult<()> {
        self.plugin.stage_seeding_host(&self.common, host).await
    }

    /// Remove local scratch data. Failures are logged, never raised.
    pub async fn cleanup(&self) {
        self.plugin.cleanup().await;
    }
}

/// Parse a chunk size such as `1024`, `4K` or `1M` into bytes.
#[must_use]
pub(crate) fn parse_chunk_size(text: &str) -> Option<u64> {
    let (digits, multiplier) = split_unit(text.trim());
    let value: u64 = digits.parse().ok()?;
    let bytes = value.checked_mul(multiplier)?;
    (bytes > 0).then_some(bytes)
}

fn split_unit(text: &str) -> (&str, u64) {
    if let Some(rest) = text.strip_suffix(['K', 'k']) {
        return (rest, 1024);
    }
    if let Some(rest) = text.strip_suffix(['M', 'm']) {
        return (rest, 1_048_576);
    }
    (text, 1)
}

/// A file that exists in name only. Useful for clients that bring
/// their own data or only need a meta file.
pub struct NoneFile;

#[must_use]
pub fn none_factory() -> Box<dyn FilePlugin> {
    Box::new(NoneFile)
}

#[async_trait]
impl FilePlugin for NoneFile {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self, _common: &mut FileCommon) -> AppResult<()> {
        Ok(())
    }
}

/// A file or directory taken from the commanding machine.
pub struct LocalFile {
    path: Option<PathBuf>,
    generate_torrent: bool,
    generate_hashes: Vec<u64>,
    rename: bool,
    is_dir: bool,
    entries: Vec<String>,
    generated_torrent: Option<PathBuf>,
}

#[must_use]
pub fn local_factory() -> Box<dyn FilePlugin> {
    Box::new(LocalFile {
        path: None,
        generate_torrent: false,
        generate_hashes: Vec::new(),
        rename: false,
        is_dir: false,
        entries: Vec::new(),
        generated_torrent: None,
    })
}

impl LocalFile {
    fn duplicate(&self, key: &str) -> AppError {
        AppError::config(ConfigError::DuplicateParameter {
            section: format!("file:{}", self.kind()),
            key: key.to_owned(),
        })
    }

    fn data_path(&self) -> AppResult<&PathBuf> {
        self.path.as_ref().ok_or_else(|| {
            AppError::config(ConfigError::MissingParameter {
                section: "file:local".to_owned(),
                key: "path",
            })
        })
    }

    fn remote_basename(&self, path: &Path) -> String {
        if self.rename && !self.is_dir {
            return "inputFile".to_owned();
        }
        data_basename(path)
    }
}

#[async_trait]
impl FilePlugin for LocalFile {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "path" => {
                if self.path.is_some() {
                    return Err(self.duplicate(key));
                }
                let path = PathBuf::from(value);
                if !path.exists() {
                    return Err(AppError::stage(StageError::FileMissing { path }));
                }
                self.path = Some(path);
                Ok(true)
            }
            "generateTorrent" => {
                self.generate_torrent = value == "yes";
                Ok(true)
            }
            "generateRootHash" => {
                let chunk_size = parse_chunk_size(value).ok_or_else(|| {
                    AppError::stage(StageError::RootHashChunkSizeSyntax {
                        key: key.to_owned(),
                        value: value.to_owned(),
                    })
                })?;
                if self.generate_hashes.contains(&chunk_size) {
                    return Err(self.duplicate(key));
                }
                self.generate_hashes.push(chunk_size);
                Ok(true)
            }
            "renameFile" => {
                self.rename = value == "yes";
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn check_settings(&mut self, common: &mut FileCommon) -> AppResult<()> {
        let path = self.data_path()?.clone();
        let metadata = std::fs::metadata(&path)
            .map_err(|_| AppError::stage(StageError::FileMissing { path: path.clone() }))?;
        self.is_dir = metadata.is_dir();
        if self.generate_torrent && common.meta_file.is_some() {
            return Err(AppError::stage(StageError::GeneratedMetaConflict {
                name: common.name.clone(),
            }));
        }
        if self.is_dir && !self.generate_hashes.is_empty() {
            return Err(AppError::stage(StageError::RootHashOnDirectory {
                name: common.name.clone(),
                path,
            }));
        }
        if self.is_dir && self.rename {
            return Err(AppError::stage(StageError::RenameDirectory {
                name: common.name.clone(),
                path,
            }));
        }
        if self.rename && self.generate_torrent {
            return Err(AppError::stage(StageError::RenameWithTorrent {
                name: common.name.clone(),
            }));
        }
        if self.is_dir {
            self.entries = walk_entries(&path)?;
        }
        for &chunk_size in &self.generate_hashes {
            if common.root_hashes.contains_key(&chunk_size) {
                return Err(AppError::stage(StageError::GeneratedHashConflict {
                    name: common.name.clone(),
                    chunk_size,
                }));
            }
            let hash = crate::meta::root_hash_of_file(&path, chunk_size)?;
            common.root_hashes.insert(chunk_size, hash);
        }
        if self.generate_torrent {
            let data = crate::meta::TorrentBuilder::new(&data_basename(&path), 1024)
                .announce("http://127.0.0.1/announce")
                .build_from_file(&path)?;
            let target = std::env::temp_dir().join(format!(
                "campaigner_meta_{}_{}.torrent",
                std::process::id(),
                common.name
            ));
            std::fs::write(&target, data)?;
            common.meta_file = Some(target.clone());
            self.generated_torrent = Some(target);
        }
        Ok(())
    }

    async fn stage_seeding_host(&self, common: &FileCommon, host: &Host) -> AppResult<()> {
        let path = self.data_path()?;
        let dir = common.file_dir(host)?;
        host.send_command(&format!("mkdir -p \"{dir}/files/\""), &Reuse::Default)
            .await?;
        let remote = format!("{dir}/files/{}", self.remote_basename(path));
        if self.is_dir {
            host.send_files(path, &remote).await
        } else {
            host.send_file(path, &remote, false).await
        }
    }

    fn remote_data_path(&self, common: &FileCommon, host: &Host) -> AppResult<Option<String>> {
        let path = self.data_path()?;
        Ok(Some(format!(
            "{}/files/{}",
            common.file_dir(host)?,
            self.remote_basename(path)
        )))
    }

    fn data_entries(&self) -> Vec<String> {
        self.entries.clone()
    }

    async fn cleanup(&self) {
        if let Some(path) = &self.generated_torrent {
            if std::fs::remove_file(path).is_err() {
                tracing::debug!("Generated torrent {} was already gone", path.display());
            }
        }
    }
}

/// The basename the staged data gets on hosts. Trailing slashes on
/// directory paths are ignored.
fn data_basename(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.to_string_lossy().into_owned(),
        |name| name.to_string_lossy().into_owned(),
    )
}

/// All paths below `root`, directories first and `/`-suffixed, sorted
/// within each directory.
fn walk_entries(root: &Path) -> AppResult<Vec<String>> {
    let mut out = Vec::new();
    collect_entries(root, "", &mut out)?;
    Ok(out)
}

fn collect_entries(directory: &Path, prefix: &str, out: &mut Vec<String>) -> AppResult<()> {
    let mut names: Vec<(String, bool)> = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let Some(name) = entry.path().file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            continue;
        };
        names.push((name, entry.path().is_dir()));
    }
    names.sort();
    for (name, is_dir) in names {
        if is_dir {
            let child_prefix = format!("{prefix}{name}/");
            out.push(child_prefix.clone());
            collect_entries(&directory.join(&name), &child_prefix, out)?;
        } else {
            out.push(format!("{prefix}{name}"));
        }
    }
    Ok(())
}
