//! Deterministic fake data, generated on the seeding hosts.
//!
//! The payload is a stream of 32-bit big-endian counter words, so any
//! byte range can be verified offline. Generation runs on the host,
//! either with a prebuilt binary or by compiling the bundled generator
//! sources with `g++` on the fly. With `count` above one the file
//! becomes a family of variants selectable as `name@index`; each
//! variant continues the counter where the previous one stopped.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::artifact::{FileCommon, FilePlugin, VariantParts, parse_chunk_size};
use crate::error::{AppError, AppResult, ConfigError, StageError};
use crate::host::{Host, Reuse};

/// Sources the on-the-fly build uploads next to the data.
const GENERATOR_FILES: [&str; 4] = ["compat.h", "fakedata.h", "fakedata.cpp", "genfakedata.cpp"];

/// Generated meta data for one variant.
#[derive(Clone)]
struct VariantArtifacts {
    meta_path: Option<PathBuf>,
    root_hashes: BTreeMap<u64, String>,
}

#[derive(Clone)]
pub struct FakedataFile {
    ksize: Option<u64>,
    filename: Option<String>,
    count: Option<usize>,
    binary: Option<String>,
    generator: Option<PathBuf>,
    generate_torrent: bool,
    generate_hashes: Vec<u64>,
    variant: usize,
    artifacts: Vec<VariantArtifacts>,
}

#[must_use]
pub fn factory() -> Box<dyn FilePlugin> {
    Box::new(FakedataFile {
        ksize: None,
        filename: None,
        count: None,
        binary: None,
        generator: None,
        generate_torrent: false,
        generate_hashes: Vec::new(),
        variant: 0,
        artifacts: Vec::new(),
    })
}

impl FakedataFile {
    fn duplicate(&self, key: &str) -> AppError {
        AppError::config(ConfigError::DuplicateParameter {
            section: format!("file:{}", self.kind()),
            key: key.to_owned(),
        })
    }

    fn ksize_value(&self) -> AppResult<u64> {
        self.ksize.ok_or_else(|| {
            AppError::config(ConfigError::MissingParameter {
                section: "file:fakedata".to_owned(),
                key: "ksize",
            })
        })
    }

    fn size_bytes(&self) -> AppResult<u64> {
        Ok(self.ksize_value()?.saturating_mul(1024))
    }

    fn variant_count(&self) -> usize {
        self.count.unwrap_or(1)
    }

    fn generator_dir(&self) -> PathBuf {
        self.generator
            .clone()
            .unwrap_or_else(|| PathBuf::from("Utils/fakedata"))
    }

    /// The filename the data gets on hosts. Variants are numbered,
    /// a single file keeps the plain name.
    fn remote_name(&self) -> String {
        let filename = self.filename.as_deref().unwrap_or("fakedata");
        if self.variant_count() > 1 {
            format!("{filename}.{}", self.variant)
        } else {
            filename.to_owned()
        }
    }

    /// The counter word this variant starts with.
    fn start_word(&self, bytes: u64) -> u64 {
        (self.variant as u64).wrapping_mul(bytes / 4)
    }

    fn check_generator_sources(&self) -> AppResult<()> {
        let generator = self.generator_dir();
        if !generator.exists() {
            return Err(AppError::stage(StageError::FileMissing { path: generator }));
        }
        if !generator.is_dir() {
            return Err(AppError::stage(StageError::NotADirectory { path: generator }));
        }
        for name in GENERATOR_FILES {
            let source = generator.join(name);
            if !source.is_file() {
                return Err(AppError::stage(StageError::FileMissing { path: source }));
            }
        }
        Ok(())
    }

    /// Write local blobs and derive the requested meta data for every
    /// variant. Blobs are cached below the temp directory; a blob with
    /// the right size is trusted and reused.
    fn generate_artifacts(&mut self, common: &mut FileCommon) -> AppResult<()> {
        let ksize = self.ksize_value()?;
        let bytes = self.size_bytes()?;
        if self.generate_torrent && common.meta_file.is_some() {
            return Err(AppError::stage(StageError::GeneratedMetaConflict {
                name: common.name.clone(),
            }));
        }
        for &chunk_size in &self.generate_hashes {
            if common.root_hashes.contains_key(&chunk_size) {
                return Err(AppError::stage(StageError::GeneratedHashConflict {
                    name: common.name.clone(),
                    chunk_size,
                }));
            }
        }
        let cache = blob_path(ksize, 0);
        if let Some(parent) = cache.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut artifacts = Vec::with_capacity(self.variant_count());
        for variant in 0..self.variant_count() {
            let blob = blob_path(ksize, variant);
            let reusable = std::fs::metadata(&blob)
                .map(|meta| meta.is_file() && meta.len() == bytes)
                .unwrap_or(false);
            if !reusable {
                let start = (variant as u64).wrapping_mul(bytes / 4);
                write_blob(&blob, bytes, start)?;
            }
            let mut root_hashes = BTreeMap::new();
            for &chunk_size in &self.generate_hashes {
                let hash = crate::meta::root_hash_of_file(&blob, chunk_size)?;
                root_hashes.insert(chunk_size, hash);
            }
            let meta_path = if self.generate_torrent {
                let name = {
                    let mut named = self.clone();
                    named.variant = variant;
                    named.remote_name()
                };
                let data = crate::meta::TorrentBuilder::new(&name, 1024)
                    .announce("http://127.0.0.1/announce")
                    .build_from_file(&blob)?;
                let target = torrent_path(&common.name, variant);
                std::fs::write(&target, data)?;
                Some(target)
            } else {
                None
            };
            artifacts.push(VariantArtifacts {
                meta_path,
                root_hashes,
            });
        }
        if let Some(first) = artifacts.first() {
            if let Some(meta) = &first.meta_path {
                common.meta_file = Some(meta.clone());
            }
            common.root_hashes.extend(first.root_hashes.clone());
        }
        self.artifacts = artifacts;
        Ok(())
    }
}

#[async_trait]
impl FilePlugin for FakedataFile {
    fn kind(&self) -> &'static str {
        "fakedata"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "ksize" => {
                if self.ksize.is_some() {
                    return Err(self.duplicate(key));
                }
                let ksize =
                    crate::config::syntax::parse_positive_u64(value).map_err(|source| {
                        AppError::config(ConfigError::InvalidValue {
                            key: key.to_owned(),
                            source,
                        })
                    })?;
                if ksize % 4 != 0 {
                    return Err(AppError::stage(StageError::FakedataSize { ksize }));
                }
                self.ksize = Some(ksize);
                Ok(true)
            }
            "filename" => {
                if self.filename.is_some() {
                    return Err(self.duplicate(key));
                }
                self.filename = Some(value.to_owned());
                Ok(true)
            }
            "count" => {
                if self.count.is_some() {
                    return Err(self.duplicate(key));
                }
                let count =
                    crate::config::syntax::parse_positive_u64(value).map_err(|source| {
                        AppError::config(ConfigError::InvalidValue {
                            key: key.to_owned(),
                            source,
                        })
                    })?;
                self.count = Some(usize::try_from(count).unwrap_or(usize::MAX));
                Ok(true)
            }
            "binary" => {
                if self.binary.is_some() {
                    return Err(self.duplicate(key));
                }
                if !value.is_empty() {
                    self.binary = Some(value.to_owned());
                }
                Ok(true)
            }
            "generator" => {
                if self.generator.is_some() {
                    return Err(self.duplicate(key));
                }
                self.generator = Some(PathBuf::from(value));
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
            _ => Ok(false),
        }
    }

    fn check_settings(&mut self, common: &mut FileCommon) -> AppResult<()> {
        self.ksize_value()?;
        if self.filename.is_none() {
            self.filename = Some("fakedata".to_owned());
        }
        if self.count.is_none() {
            self.count = Some(1);
        }
        if self.binary.is_none() {
            self.check_generator_sources()?;
        }
        if self.generate_torrent || !self.generate_hashes.is_empty() {
            self.generate_artifacts(common)?;
        }
        Ok(())
    }

    async fn stage_host(&self, common: &FileCommon, host: &Host) -> AppResult<()> {
        let dir = common.file_dir(host)?;
        host.send_command(&format!("mkdir -p \"{dir}/files\""), &Reuse::Default)
            .await?;
        Ok(())
    }

    async fn stage_seeding_host(&self, common: &FileCommon, host: &Host) -> AppResult<()> {
        let dir = common.file_dir(host)?;
        let binary = match &self.binary {
            Some(binary) => {
                let reply = host
                    .send_command(
                        &format!(
                            "[ -e \"{binary}\" -a -x \"{binary}\" ] && echo \"Y\" || echo \"N\""
                        ),
                        &Reuse::Default,
                    )
                    .await?;
                if reply != "Y" {
                    return Err(AppError::stage(StageError::FakedataBinaryMissing {
                        binary: binary.clone(),
                        host: host.name().to_owned(),
                    }));
                }
                binary.clone()
            }
            None => {
                let build_dir = format!("{dir}/fakedata-source");
                host.send_command(&format!("mkdir -p \"{build_dir}\""), &Reuse::Default)
                    .await?;
                let generator = self.generator_dir();
                for name in GENERATOR_FILES {
                    host.send_file(&generator.join(name), &format!("{build_dir}/{name}"), true)
                        .await?;
                }
                let reply = host
                    .send_command(
                        &format!(
                            "( cd \"{build_dir}\"; g++ *.cpp -o genfakedata && echo && echo \"OK\" )"
                        ),
                        &Reuse::Default,
                    )
                    .await?;
                if !reply.ends_with("OK") {
                    return Err(AppError::stage(StageError::FakedataBuildFailed {
                        host: host.name().to_owned(),
                        output: reply,
                    }));
                }
                format!("{build_dir}/genfakedata")
            }
        };
        let bytes = self.size_bytes()?;
        let target = format!("{dir}/files/{}", self.remote_name());
        let command = if self.variant_count() > 1 {
            let start = self.start_word(bytes);
            format!("\"{binary}\" \"{target}\" {bytes} {start} && echo && echo \"OK\"")
        } else {
            format!("\"{binary}\" \"{target}\" {bytes} && echo && echo \"OK\"")
        };
        let reply = host.send_command(&command, &Reuse::Default).await?;
        if !reply.ends_with("OK") {
            return Err(AppError::stage(StageError::FakedataGenerationFailed {
                host: host.name().to_owned(),
                output: reply,
            }));
        }
        Ok(())
    }

    fn remote_data_path(&self, common: &FileCommon, host: &Host) -> AppResult<Option<String>> {
        Ok(Some(format!(
            "{}/files/{}",
            common.file_dir(host)?,
            self.remote_name()
        )))
    }

    fn variants(&self) -> Option<usize> {
        Some(self.variant_count())
    }

    fn select_variant(&self, index: usize) -> Option<VariantParts> {
        if index >= self.variant_count() {
            return None;
        }
        let mut plugin = self.clone();
        plugin.variant = index;
        let (meta_file, root_hashes) = self.artifacts.get(index).map_or_else(
            || (None, BTreeMap::new()),
            |artifacts| (artifacts.meta_path.clone(), artifacts.root_hashes.clone()),
        );
        Some(VariantParts {
            plugin: Box::new(plugin),
            meta_file,
            root_hashes,
        })
    }

    async fn cleanup(&self) {
        for artifacts in &self.artifacts {
            if let Some(path) = &artifacts.meta_path {
                if std::fs::remove_file(path).is_err() {
                    tracing::debug!("Generated torrent {} was already gone", path.display());
                }
            }
        }
    }
}

fn blob_path(ksize: u64, variant: usize) -> PathBuf {
    std::env::temp_dir()
        .join("campaigner-fakedata")
        .join(format!("fake_{ksize}k_{variant}"))
}

fn torrent_path(name: &str, variant: usize) -> PathBuf {
    std::env::temp_dir().join(format!(
        "campaigner_meta_{}_{name}_{variant}.torrent",
        std::process::id()
    ))
}

/// Write one counter blob. The first word is `start_word`, every
/// following word counts up, wrapping at 32 bits.
fn write_blob(path: &Path, bytes: u64, start_word: u64) -> AppResult<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    let words = bytes / 4;
    let mut word = start_word;
    for _ in 0..words {
        writer.write_all(&(word as u32).to_be_bytes())?;
        word = word.wrapping_add(1);
    }
    writer.flush()?;
    Ok(())
}
