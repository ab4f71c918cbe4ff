//! The Manifest Generator: turns a Dockerfile-like instruction sequence and
//! a layer list into OCI config/manifest/index documents, then digests and
//! validates them.
//!
//! Document construction goes through `oci_spec::image`'s `*Builder` types,
//! the same pattern the teacher crate uses for every OCI document it emits
//! (`new_empty_manifest`, `push_layer_annotated`). Canonical JSON for
//! digesting goes through `olpc_cjson`, the way `ostree-ext` serializes OCI
//! documents for reproducible digests.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    Arch, Config, ConfigBuilder, Descriptor, DescriptorBuilder, History, HistoryBuilder,
    ImageConfiguration, ImageConfigurationBuilder, ImageIndex, ImageIndexBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, Platform as OciPlatform, PlatformBuilder, RootFs,
    RootFsBuilder, SCHEMA_VERSION,
};

use crate::error::{CoreError, Result};
use crate::layer::Layer;

pub mod instruction;

use instruction::{parse_cmd_like, parse_env, parse_expose, parse_healthcheck, parse_label};

/// Architectures this generator accepts in a [`Platform`].
pub const ALLOWED_ARCHITECTURES: &[&str] = &[
    "386", "amd64", "arm", "arm64", "ppc64le", "s390x", "mips64le", "riscv64",
];

/// Operating systems this generator accepts in a [`Platform`].
pub const ALLOWED_OS: &[&str] = &[
    "linux", "windows", "darwin", "freebsd", "netbsd", "openbsd", "solaris",
];

/// Manifest media types this generator accepts when validating an
/// [`ImageManifest`].
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Index media types this generator accepts when validating an
/// [`ImageIndex`].
pub const INDEX_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

const RESERVED_ANNOTATION_PREFIX: &str = "org.opencontainers.";
const MANIFEST_SIZE_CEILING: usize = 4 * 1024 * 1024;
const INDEX_SIZE_CEILING: usize = 4 * 1024 * 1024;
const CONFIG_SIZE_CEILING: usize = 8 * 1024 * 1024;

/// A normalized Dockerfile directive: an upper-cased verb, its unparsed
/// argument string, and an advisory source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub command: String,
    pub value: String,
    pub line: u32,
}

impl Instruction {
    pub fn new(command: impl Into<String>, value: impl Into<String>, line: u32) -> Self {
        Self {
            command: command.into().to_ascii_uppercase(),
            value: value.into(),
            line,
        }
    }
}

/// A target platform for an image config or a manifest-list entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    pub variant: Option<String>,
    pub os_version: Option<String>,
    pub os_features: Option<Vec<String>>,
}

impl Platform {
    pub fn new(architecture: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            variant: None,
            os_version: None,
            os_features: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    fn to_oci(&self) -> Result<OciPlatform> {
        let mut builder = PlatformBuilder::default()
            .architecture(arch_from_str(&self.architecture))
            .os(os_from_str(&self.os));
        if let Some(variant) = &self.variant {
            builder = builder.variant(variant.clone());
        }
        if let Some(os_version) = &self.os_version {
            builder = builder.os_version(os_version.clone());
        }
        if let Some(os_features) = &self.os_features {
            builder = builder.os_features(os_features.clone());
        }
        builder
            .build()
            .map_err(|e| CoreError::validation("generate_image_index", e))
    }
}

// `Arch`/`Os` are mapped through their `Other(String)` catch-all for every
// value beyond the couple of named variants this codebase's lineage is
// observed to construct directly (`Arch::Amd64`/`Arch::ARM64`/
// `Arch::Mips64le`, `Os::Linux`); `Other` round-trips the raw OCI string
// exactly, which is all a `Platform`'s architecture/os need to do here.
fn arch_from_str(s: &str) -> Arch {
    match s {
        "amd64" => Arch::Amd64,
        "arm64" => Arch::ARM64,
        "mips64le" => Arch::Mips64le,
        other => Arch::Other(other.to_string()),
    }
}

fn os_from_str(s: &str) -> Os {
    match s {
        "linux" => Os::Linux,
        other => Os::Other(other.to_string()),
    }
}

/// Map a layer media-type string (one of [`crate::layer::LAYER_MEDIA_TYPES`])
/// to the corresponding `oci_spec::image::MediaType` variant.
fn layer_media_type_from_str(s: &str) -> MediaType {
    match s {
        "application/vnd.oci.image.layer.v1.tar" => MediaType::ImageLayer,
        "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::ImageLayerGzip,
        "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::ImageLayerZstd,
        "application/vnd.oci.image.layer.nondistributable.v1.tar" => {
            MediaType::ImageLayerNonDistributable
        }
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip" => {
            MediaType::ImageLayerNonDistributableGzip
        }
        "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => {
            MediaType::ImageLayerNonDistributableZstd
        }
        other => MediaType::Other(other.to_string()),
    }
}

/// A single `PlatformManifest` entry for [`generate_image_index`]: a
/// manifest descriptor paired with the platform it targets.
#[derive(Clone, Debug)]
pub struct PlatformManifest {
    pub digest: String,
    pub size: u64,
    pub platform: Platform,
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Options governing [`generate_image_config`] beyond the instruction list
/// itself.
#[derive(Clone, Debug)]
pub struct ConfigOptions {
    pub generate_history: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub author: Option<String>,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            generate_history: true,
            timestamp: None,
            author: None,
        }
    }
}

impl ConfigOptions {
    pub fn with_generate_history(mut self, generate_history: bool) -> Self {
        self.generate_history = generate_history;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// The Docker-legacy healthcheck shape (not part of the OCI image-spec
/// proper, but carried through `config.config.Healthcheck` by every
/// Docker-compatible consumer).
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "Test")]
    pub test: Vec<String>,
}

/// An OCI image configuration document in progress.
///
/// Wraps [`oci_spec::image::ImageConfiguration`], the type every
/// OCI-producing repo in this crate's lineage serializes directly; the
/// handful of Docker-legacy `config.config` fields the OCI crate's `Config`
/// type does not model (`ExposedPorts`/`Volumes`/`Shell`/`Healthcheck`/
/// `OnBuild`) are tracked alongside it and spliced into the serialized
/// document in [`serialize_config`].
#[derive(Clone, Debug)]
pub struct ImageConfig {
    configuration: ImageConfiguration,
    exposed_ports: BTreeSet<String>,
    volumes: BTreeSet<String>,
    shell: Option<Vec<String>>,
    healthcheck: Option<HealthCheck>,
    on_build: Vec<String>,
}

impl ImageConfig {
    pub fn configuration(&self) -> &ImageConfiguration {
        &self.configuration
    }

    pub fn rootfs(&self) -> &RootFs {
        self.configuration.rootfs()
    }

    /// Normalized `port/proto` strings collected from `EXPOSE` instructions.
    pub fn exposed_ports(&self) -> &BTreeSet<String> {
        &self.exposed_ports
    }

    /// Normalized mount-point strings collected from `VOLUME` instructions.
    pub fn volumes(&self) -> &BTreeSet<String> {
        &self.volumes
    }
}

/// The Manifest Generator: a stateless collection of operations over
/// [`Instruction`]/[`Platform`]/[`Layer`] inputs.
///
/// Unlike [`crate::layer::LayerEngine`], this component holds no cache or
/// other mutable state — every OCI document it produces is a pure function
/// of its inputs, so a single instance (or none at all; the methods could
/// equally be free functions) is always safe to share across builds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestGenerator;

impl ManifestGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build an [`ImageConfig`] from an ordered instruction list and target
    /// platform, per spec.md §4.3.1.
    #[tracing::instrument(skip(self, instructions), fields(instructions = instructions.len()))]
    pub fn generate_image_config(
        &self,
        instructions: &[Instruction],
        platform: &Platform,
        options: &ConfigOptions,
    ) -> Result<ImageConfig> {
        let created = options
            .timestamp
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Nanos, true);

        let mut user = String::new();
        let mut working_dir = "/".to_string();
        let mut cmd: Option<Vec<String>> = None;
        let mut entrypoint: Option<Vec<String>> = None;
        let mut env: Vec<String> = Vec::new();
        let mut exposed_ports = BTreeSet::new();
        let mut volumes = BTreeSet::new();
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        let mut stop_signal: Option<String> = None;
        let mut shell: Option<Vec<String>> = None;
        let mut healthcheck: Option<HealthCheck> = None;
        let mut on_build: Vec<String> = Vec::new();
        let mut history: Vec<History> = Vec::new();

        for instruction in instructions {
            let mut history_comment = None;
            match instruction.command.as_str() {
                "FROM" | "RUN" | "COPY" | "ADD" => {}
                "CMD" => cmd = Some(parse_cmd_like(&instruction.value)),
                "ENTRYPOINT" => entrypoint = Some(parse_cmd_like(&instruction.value)),
                "ENV" => env.push(parse_env(&instruction.value).map_err(|e| {
                    CoreError::validation("generate_image_config", e)
                })?),
                "EXPOSE" => {
                    for port in parse_expose(&instruction.value) {
                        exposed_ports.insert(port);
                    }
                }
                "VOLUME" => {
                    for volume in parse_volume(&instruction.value) {
                        volumes.insert(volume);
                    }
                }
                "WORKDIR" => working_dir = instruction.value.trim().to_string(),
                "USER" => user = instruction.value.trim().to_string(),
                "LABEL" => {
                    for (k, v) in parse_label(&instruction.value) {
                        labels.insert(k, v);
                    }
                }
                "SHELL" => shell = Some(parse_cmd_like(&instruction.value)),
                "STOPSIGNAL" => stop_signal = Some(instruction.value.trim().to_string()),
                "HEALTHCHECK" => healthcheck = Some(parse_healthcheck(&instruction.value)),
                "ONBUILD" => on_build.push(instruction.value.clone()),
                _ => history_comment = Some("unknown instruction".to_string()),
            }

            if options.generate_history {
                let mut builder = HistoryBuilder::default()
                    .created(created.clone())
                    .created_by(format!("{} {}", instruction.command, instruction.value));
                if let Some(comment) = history_comment {
                    builder = builder.comment(comment);
                }
                if let Some(author) = &options.author {
                    builder = builder.author(author.clone());
                }
                let entry = builder
                    .build()
                    .map_err(|e| CoreError::validation("generate_image_config", e))?;
                history.push(entry);
            }
        }

        let mut config_builder = ConfigBuilder::default()
            .user(user)
            .working_dir(working_dir)
            .env(env);
        if let Some(cmd) = cmd {
            config_builder = config_builder.cmd(cmd);
        }
        if let Some(entrypoint) = entrypoint {
            config_builder = config_builder.entrypoint(entrypoint);
        }
        if !labels.is_empty() {
            config_builder = config_builder.labels(
                labels
                    .clone()
                    .into_iter()
                    .collect::<std::collections::HashMap<_, _>>(),
            );
        }
        if let Some(stop_signal) = &stop_signal {
            config_builder = config_builder.stop_signal(stop_signal.clone());
        }
        if !exposed_ports.is_empty() {
            config_builder =
                config_builder.exposed_ports(exposed_ports.iter().cloned().collect::<Vec<_>>());
        }
        if !volumes.is_empty() {
            config_builder = config_builder.volumes(volumes.iter().cloned().collect::<Vec<_>>());
        }
        let runtime_config: Config = config_builder
            .build()
            .map_err(|e| CoreError::validation("generate_image_config", e))?;

        let rootfs: RootFs = RootFsBuilder::default()
            .typ("layers".to_string())
            .diff_ids(Vec::<String>::new())
            .build()
            .map_err(|e| CoreError::validation("generate_image_config", e))?;

        let mut configuration_builder = ImageConfigurationBuilder::default()
            .architecture(arch_from_str(&platform.architecture))
            .os(os_from_str(&platform.os))
            .created(created.clone())
            .config(runtime_config)
            .rootfs(rootfs)
            .history(history);
        if let Some(variant) = &platform.variant {
            configuration_builder = configuration_builder.variant(variant.clone());
        }
        if let Some(author) = &options.author {
            configuration_builder = configuration_builder.author(author.clone());
        }
        let configuration = configuration_builder
            .build()
            .map_err(|e| CoreError::validation("generate_image_config", e))?;

        let config = ImageConfig {
            configuration,
            exposed_ports,
            volumes,
            shell,
            healthcheck,
            on_build,
        };
        validate_image_config(&config)
            .map_err(|e| CoreError::generation("generate_image_config", e))?;
        Ok(config)
    }

    /// Append `layer`'s digest to `config.rootfs.diff_ids`, and (when
    /// history is enabled by the caller's earlier [`ConfigOptions`]) a
    /// history entry pulled from the layer's own metadata, per spec.md
    /// §4.3.2.
    ///
    /// Per spec.md §4.3.2's explicit note, `diff_ids` is populated with the
    /// layer's own (possibly compressed) `digest`, not a separate digest of
    /// the uncompressed tar stream — this preserves the source system's
    /// reference behavior rather than "fixing" it to strict OCI semantics.
    pub fn add_layer_to_config(&self, config: &mut ImageConfig, layer: &Layer) -> Result<()> {
        if !layer.is_empty_layer() {
            if !crate::layer::is_valid_digest(layer.digest()) {
                return Err(CoreError::validation(
                    "add_layer_to_config",
                    format!("layer digest {:?} is not a valid sha256 digest", layer.digest()),
                ));
            }
            let mut rootfs = config.configuration.rootfs().clone();
            let mut diff_ids = rootfs.diff_ids().clone();
            diff_ids.push(layer.digest().to_string());
            rootfs.set_diff_ids(diff_ids);
            config.configuration.set_rootfs(rootfs);
        }

        let mut history = config.configuration.history().clone();
        let mut builder = HistoryBuilder::default().created(
            layer
                .created()
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        if let Some(created_by) = layer.created_by() {
            builder = builder.created_by(created_by.to_string());
        }
        if let Some(comment) = layer.comment() {
            builder = builder.comment(comment.to_string());
        }
        if layer.is_empty_layer() {
            builder = builder.empty_layer(true);
        }
        let entry = builder
            .build()
            .map_err(|e| CoreError::validation("add_layer_to_config", e))?;
        history.push(entry);
        config.configuration.set_history(history);
        Ok(())
    }

    /// Build an [`ImageManifest`] wrapping `config` and `layers`, per
    /// spec.md §4.3.3. Empty-layer markers carry no blob and no digest, so
    /// they are omitted from the manifest's layer descriptors entirely
    /// (they still contribute a history entry via `add_layer_to_config`).
    pub fn generate_image_manifest(
        &self,
        config: &ImageConfig,
        layers: &[Layer],
    ) -> Result<ImageManifest> {
        let config_bytes = serialize_config(config)?;
        let config_digest = sha256_digest(&config_bytes)?;

        let config_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .size(config_bytes.len() as i64)
            .digest(config_digest)
            .build()
            .map_err(|e| CoreError::validation("generate_image_manifest", e))?;

        let mut layer_descriptors = Vec::with_capacity(layers.len());
        for layer in layers {
            if layer.is_empty_layer() {
                continue;
            }
            let mut builder = DescriptorBuilder::default()
                .media_type(layer_media_type_from_str(layer.media_type()))
                .size(layer.size() as i64)
                .digest(layer.digest().to_string());
            if let Some(annotations) = layer.annotations() {
                builder = builder.annotations(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<std::collections::HashMap<_, _>>(),
                );
            }
            let descriptor = builder
                .build()
                .map_err(|e| CoreError::validation("generate_image_manifest", e))?;
            layer_descriptors.push(descriptor);
        }

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(layer_descriptors)
            .build()
            .map_err(|e| CoreError::validation("generate_image_manifest", e))?;

        validate_image_manifest(&manifest)
            .map_err(|e| CoreError::generation("generate_image_manifest", e))?;
        Ok(manifest)
    }

    /// Build an [`ImageIndex`] (manifest list) from a set of per-platform
    /// manifest descriptors, per spec.md §4.3.3.
    pub fn generate_image_index(&self, entries: &[PlatformManifest]) -> Result<ImageIndex> {
        let mut seen: BTreeSet<(String, String, String)> = BTreeSet::new();
        let mut sortable: Vec<(String, String, String, &PlatformManifest)> =
            Vec::with_capacity(entries.len());
        for entry in entries {
            let key = (
                entry.platform.os.clone(),
                entry.platform.architecture.clone(),
                entry.platform.variant.clone().unwrap_or_default(),
            );
            if !seen.insert(key.clone()) {
                return Err(CoreError::validation(
                    "generate_image_index",
                    format!(
                        "duplicate platform entry for (os={}, architecture={}, variant={})",
                        key.0, key.1, key.2
                    ),
                ));
            }
            sortable.push((key.0, key.1, key.2, entry));
        }
        sortable.sort_by(|a, b| (&a.0, &a.1, &a.2).cmp(&(&b.0, &b.1, &b.2)));

        let mut manifests = Vec::with_capacity(sortable.len());
        for (_, _, _, entry) in sortable {
            if !crate::layer::is_valid_digest(&entry.digest) {
                return Err(CoreError::validation(
                    "generate_image_index",
                    format!("manifest digest {:?} is not a valid sha256 digest", entry.digest),
                ));
            }
            let platform = entry.platform.to_oci()?;
            let mut builder = DescriptorBuilder::default()
                .media_type(MediaType::ImageManifest)
                .size(entry.size as i64)
                .digest(entry.digest.clone())
                .platform(platform);
            if let Some(annotations) = &entry.annotations {
                builder = builder.annotations(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<std::collections::HashMap<_, _>>(),
                );
            }
            let descriptor = builder
                .build()
                .map_err(|e| CoreError::validation("generate_image_index", e))?;
            manifests.push(descriptor);
        }

        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(manifests)
            .build()
            .map_err(|e| CoreError::validation("generate_image_index", e))?;

        validate_manifest_list(&index)
            .map_err(|e| CoreError::generation("generate_image_index", e))?;
        Ok(index)
    }
}

fn parse_volume(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items;
        }
    }
    trimmed
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn canonical_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, olpc_cjson::CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .map_err(|e| CoreError::serialization("serialize", e))?;
    Ok(buf)
}

fn sha256_digest(bytes: &[u8]) -> Result<String> {
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), bytes)
        .map_err(|e| CoreError::digest("calculate_digest", std::io::Error::other(e)))?;
    Ok(format!("sha256:{}", hex::encode(digest)))
}

/// Serialize `manifest` to canonical JSON bytes, per spec.md §4.3.3.
pub fn serialize_manifest(manifest: &ImageManifest) -> Result<Vec<u8>> {
    canonical_json(manifest)
}

/// Serialize `index` to canonical JSON bytes, per spec.md §4.3.3.
pub fn serialize_index(index: &ImageIndex) -> Result<Vec<u8>> {
    canonical_json(index)
}

/// Serialize `config` to canonical JSON bytes, splicing the Docker-legacy
/// `config.config` fields (`ExposedPorts`, `Volumes`, `Shell`, `Healthcheck`,
/// `OnBuild`) that `oci_spec::image::Config` does not model alongside the
/// fields it does.
pub fn serialize_config(config: &ImageConfig) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(&config.configuration)
        .map_err(|e| CoreError::serialization("serialize_config", e))?;
    if let Some(inner) = value.get_mut("config").and_then(|v| v.as_object_mut()) {
        if !config.exposed_ports.is_empty() {
            let ports: BTreeMap<&String, serde_json::Value> = config
                .exposed_ports
                .iter()
                .map(|p| (p, serde_json::json!({})))
                .collect();
            inner.insert("ExposedPorts".to_string(), serde_json::json!(ports));
        }
        if !config.volumes.is_empty() {
            let volumes: BTreeMap<&String, serde_json::Value> = config
                .volumes
                .iter()
                .map(|v| (v, serde_json::json!({})))
                .collect();
            inner.insert("Volumes".to_string(), serde_json::json!(volumes));
        }
        if let Some(shell) = &config.shell {
            inner.insert("Shell".to_string(), serde_json::json!(shell));
        }
        if let Some(healthcheck) = &config.healthcheck {
            inner.insert(
                "Healthcheck".to_string(),
                serde_json::to_value(healthcheck)
                    .map_err(|e| CoreError::serialization("serialize_config", e))?,
            );
        }
        if !config.on_build.is_empty() {
            inner.insert("OnBuild".to_string(), serde_json::json!(config.on_build));
        }
    }
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, olpc_cjson::CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .map_err(|e| CoreError::serialization("serialize_config", e))?;
    Ok(buf)
}

/// `sha256:` + lowercase hex of `manifest`'s canonical serialization.
pub fn calculate_manifest_digest(manifest: &ImageManifest) -> Result<String> {
    sha256_digest(&serialize_manifest(manifest)?)
}

/// `sha256:` + lowercase hex of `index`'s canonical serialization.
pub fn calculate_index_digest(index: &ImageIndex) -> Result<String> {
    sha256_digest(&serialize_index(index)?)
}

/// `sha256:` + lowercase hex of `config`'s canonical serialization.
pub fn calculate_config_digest(config: &ImageConfig) -> Result<String> {
    sha256_digest(&serialize_config(config)?)
}

fn validate_descriptor(operation: &str, descriptor: &Descriptor) -> Result<()> {
    if descriptor.media_type().to_string().is_empty() {
        return Err(CoreError::validation(operation, "descriptor media_type is empty"));
    }
    if descriptor.size() < 0 {
        return Err(CoreError::validation(operation, "descriptor size is negative"));
    }
    if !crate::layer::is_valid_digest(&descriptor.digest().to_string()) {
        return Err(CoreError::validation(
            operation,
            format!("descriptor digest {:?} is not a valid sha256 digest", descriptor.digest()),
        ));
    }
    Ok(())
}

fn reject_reserved_annotations(
    operation: &str,
    annotations: &Option<std::collections::HashMap<String, String>>,
) -> Result<()> {
    if let Some(annotations) = annotations {
        for key in annotations.keys() {
            if key.starts_with(RESERVED_ANNOTATION_PREFIX) {
                return Err(CoreError::validation(
                    operation,
                    format!("annotation key {key:?} uses the reserved prefix {RESERVED_ANNOTATION_PREFIX:?}"),
                ));
            }
        }
    }
    Ok(())
}

/// Validate `manifest` against the descriptor, schema-version, media-type,
/// and non-empty-layers rules of spec.md §4.3.4.
pub fn validate_image_manifest(manifest: &ImageManifest) -> Result<()> {
    const OP: &str = "validate_image_manifest";
    let bytes = serialize_manifest(manifest)?;
    if bytes.len() > MANIFEST_SIZE_CEILING {
        return Err(CoreError::validation(
            OP,
            format!("manifest is {} bytes, exceeding the {MANIFEST_SIZE_CEILING}-byte ceiling", bytes.len()),
        ));
    }
    if manifest.schema_version() != 2 {
        return Err(CoreError::validation(OP, "schemaVersion must be 2"));
    }
    let media_type = manifest.media_type().to_string();
    if !MANIFEST_MEDIA_TYPES.contains(&media_type.as_str()) {
        return Err(CoreError::validation(OP, format!("unrecognized manifest media type {media_type:?}")));
    }
    validate_descriptor(OP, manifest.config())?;
    if manifest.config().media_type().to_string() != MediaType::ImageConfig.to_string() {
        return Err(CoreError::validation(OP, "config descriptor is not of a config media type"));
    }
    if manifest.layers().is_empty() {
        return Err(CoreError::validation(OP, "manifest has no layers"));
    }
    for layer in manifest.layers() {
        validate_descriptor(OP, layer)?;
        if !crate::layer::LAYER_MEDIA_TYPES.contains(&layer.media_type().to_string().as_str()) {
            return Err(CoreError::validation(
                OP,
                format!("layer descriptor media type {:?} is not a recognized layer type", layer.media_type()),
            ));
        }
    }
    reject_reserved_annotations(OP, manifest.annotations())?;
    Ok(())
}

/// Validate `index` against the schema-version, media-type, non-empty, and
/// unique-platform rules of spec.md §4.3.4.
pub fn validate_manifest_list(index: &ImageIndex) -> Result<()> {
    const OP: &str = "validate_manifest_list";
    let bytes = serialize_index(index)?;
    if bytes.len() > INDEX_SIZE_CEILING {
        return Err(CoreError::validation(
            OP,
            format!("index is {} bytes, exceeding the {INDEX_SIZE_CEILING}-byte ceiling", bytes.len()),
        ));
    }
    if index.schema_version() != 2 {
        return Err(CoreError::validation(OP, "schemaVersion must be 2"));
    }
    let media_type = index.media_type().to_string();
    if !INDEX_MEDIA_TYPES.contains(&media_type.as_str()) {
        return Err(CoreError::validation(OP, format!("unrecognized index media type {media_type:?}")));
    }
    if index.manifests().is_empty() {
        return Err(CoreError::validation(OP, "index has no manifests"));
    }
    let mut seen = BTreeSet::new();
    for entry in index.manifests() {
        validate_descriptor(OP, entry)?;
        let platform = entry
            .platform()
            .as_ref()
            .ok_or_else(|| CoreError::validation(OP, "manifest-list entry has no platform"))?;
        validate_platform(OP, platform)?;
        let key = (
            platform.os().to_string(),
            platform.architecture().to_string(),
            platform.variant().clone().unwrap_or_default(),
        );
        if !seen.insert(key) {
            return Err(CoreError::validation(OP, "duplicate platform entry in index"));
        }
    }
    Ok(())
}

fn validate_platform(operation: &str, platform: &OciPlatform) -> Result<()> {
    let architecture = platform.architecture().to_string();
    let os = platform.os().to_string();
    if architecture.is_empty() {
        return Err(CoreError::validation(operation, "platform architecture is empty"));
    }
    if os.is_empty() {
        return Err(CoreError::validation(operation, "platform os is empty"));
    }
    if !ALLOWED_ARCHITECTURES.contains(&architecture.as_str()) {
        return Err(CoreError::validation(operation, format!("unrecognized architecture {architecture:?}")));
    }
    if !ALLOWED_OS.contains(&os.as_str()) {
        return Err(CoreError::validation(operation, format!("unrecognized os {os:?}")));
    }
    if architecture == "arm" {
        if let Some(variant) = platform.variant() {
            if !["v6", "v7", "v8"].contains(&variant.as_str()) {
                return Err(CoreError::validation(operation, format!("unrecognized arm variant {variant:?}")));
            }
        }
    }
    Ok(())
}

/// Validate `config` against the architecture/os/rootfs/diff-id/env/
/// working-dir/exposed-port/history rules of spec.md §4.3.4.
pub fn validate_image_config(config: &ImageConfig) -> Result<()> {
    const OP: &str = "validate_image_config";
    let bytes = serialize_config(config)?;
    if bytes.len() > CONFIG_SIZE_CEILING {
        return Err(CoreError::validation(
            OP,
            format!("config is {} bytes, exceeding the {CONFIG_SIZE_CEILING}-byte ceiling", bytes.len()),
        ));
    }
    let configuration = &config.configuration;
    let architecture = configuration.architecture().to_string();
    let os = configuration.os().to_string();
    if architecture.is_empty() {
        return Err(CoreError::validation(OP, "config architecture is empty"));
    }
    if os.is_empty() {
        return Err(CoreError::validation(OP, "config os is empty"));
    }
    if let Some(created) = configuration.created() {
        DateTime::parse_from_rfc3339(created)
            .map_err(|e| CoreError::validation(OP, format!("config created timestamp {created:?} is invalid: {e}")))?;
    }
    let rootfs = configuration.rootfs();
    if rootfs.typ().as_str() != "layers" {
        return Err(CoreError::validation(OP, "rootfs.type must be \"layers\""));
    }
    for diff_id in rootfs.diff_ids() {
        if !crate::layer::is_valid_digest(diff_id) {
            return Err(CoreError::validation(OP, format!("diff_id {diff_id:?} is not a valid sha256 digest")));
        }
    }
    if let Some(runtime) = configuration.config() {
        if let Some(env) = runtime.env() {
            for entry in env {
                if !entry.contains('=') {
                    return Err(CoreError::validation(OP, format!("env entry {entry:?} has no '='")));
                }
            }
        }
        if let Some(working_dir) = runtime.working_dir() {
            if !working_dir.is_empty() && !working_dir.starts_with('/') {
                return Err(CoreError::validation(OP, format!("working_dir {working_dir:?} is not absolute")));
            }
        }
    }
    for port in &config.exposed_ports {
        if !is_valid_exposed_port(port) {
            return Err(CoreError::validation(OP, format!("exposed port {port:?} is not N/tcp|udp|sctp")));
        }
    }
    for entry in configuration.history() {
        if let Some(created) = entry.created() {
            DateTime::parse_from_rfc3339(created).map_err(|e| {
                CoreError::validation(OP, format!("history entry created timestamp {created:?} is invalid: {e}"))
            })?;
        }
    }
    Ok(())
}

fn is_valid_exposed_port(port: &str) -> bool {
    let Some((number, proto)) = port.split_once('/') else {
        return false;
    };
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(proto, "tcp" | "udp" | "sctp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Compression, LayerConfig, LayerEngine};

    fn base_instructions() -> Vec<Instruction> {
        vec![
            Instruction::new("FROM", "scratch", 1),
            Instruction::new("ENV", "PATH=/usr/bin", 2),
            Instruction::new("EXPOSE", "80 443/udp", 3),
            Instruction::new("LABEL", "org.example.app=demo", 4),
            Instruction::new("CMD", r#"["/bin/sh"]"#, 5),
        ]
    }

    fn fixed_options() -> ConfigOptions {
        ConfigOptions::default().with_timestamp(
            DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    #[test]
    fn generate_image_config_applies_instruction_table() {
        let generator = ManifestGenerator::new();
        let platform = Platform::new("amd64", "linux");
        let config = generator
            .generate_image_config(&base_instructions(), &platform, &fixed_options())
            .unwrap();
        let runtime = config.configuration.config().as_ref().unwrap();
        assert_eq!(runtime.env().as_ref().unwrap(), &vec!["PATH=/usr/bin".to_string()]);
        assert_eq!(runtime.cmd().as_ref().unwrap(), &vec!["/bin/sh".to_string()]);
        assert_eq!(
            runtime.labels().as_ref().unwrap().get("org.example.app"),
            Some(&"demo".to_string())
        );
        assert!(config.exposed_ports.contains("80/tcp"));
        assert!(config.exposed_ports.contains("443/udp"));
        assert_eq!(config.configuration.history().len(), base_instructions().len());
    }

    #[test]
    fn generate_image_config_rejects_non_absolute_working_dir() {
        let generator = ManifestGenerator::new();
        let platform = Platform::new("amd64", "linux");
        let mut instructions = base_instructions();
        instructions.push(Instruction::new("WORKDIR", "relative/path", 6));
        let err = generator
            .generate_image_config(&instructions, &platform, &fixed_options())
            .unwrap_err();
        assert!(matches!(err, CoreError::Generation { .. }));
    }

    #[test]
    fn manifest_and_config_digest_is_reproducible() {
        let generator = ManifestGenerator::new();
        let platform = Platform::new("amd64", "linux");
        let config_a = generator
            .generate_image_config(&base_instructions(), &platform, &fixed_options())
            .unwrap();
        let config_b = generator
            .generate_image_config(&base_instructions(), &platform, &fixed_options())
            .unwrap();
        assert_eq!(
            calculate_config_digest(&config_a).unwrap(),
            calculate_config_digest(&config_b).unwrap()
        );

        let mut engine = LayerEngine::new();
        let layer = engine
            .create_layer(
                vec![crate::change::memory_file_change(
                    "/a.txt",
                    crate::change::ChangeType::Add,
                    0o644,
                    0,
                    0,
                    1_700_000_000,
                    b"x".to_vec(),
                )],
                &LayerConfig::default().with_compression(Compression::Gzip),
            )
            .unwrap();
        let manifest_a = generator.generate_image_manifest(&config_a, &[layer.clone()]).unwrap();
        let manifest_b = generator.generate_image_manifest(&config_b, &[layer]).unwrap();
        assert_eq!(
            calculate_manifest_digest(&manifest_a).unwrap(),
            calculate_manifest_digest(&manifest_b).unwrap()
        );
    }

    #[test]
    fn generate_image_index_sorts_and_rejects_duplicates() {
        let generator = ManifestGenerator::new();
        let digest = format!("sha256:{}", "a".repeat(64));
        let entries = vec![
            PlatformManifest {
                digest: digest.clone(),
                size: 100,
                platform: Platform::new("arm64", "linux"),
                annotations: None,
            },
            PlatformManifest {
                digest: digest.clone(),
                size: 100,
                platform: Platform::new("amd64", "linux"),
                annotations: None,
            },
        ];
        let index = generator.generate_image_index(&entries).unwrap();
        let architectures: Vec<_> = index
            .manifests()
            .iter()
            .map(|d| d.platform().as_ref().unwrap().architecture().to_string())
            .collect();
        assert_eq!(architectures, vec!["amd64".to_string(), "arm64".to_string()]);

        let duplicate = vec![
            PlatformManifest {
                digest,
                size: 100,
                platform: Platform::new("amd64", "linux"),
                annotations: None,
            };
            2
        ];
        let err = generator.generate_image_index(&duplicate).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn validate_image_manifest_rejects_reserved_annotation_prefix() {
        let mut annotations = std::collections::HashMap::new();
        annotations.insert("org.opencontainers.image.title".to_string(), "x".to_string());
        let config_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .size(2i64)
            .digest(format!("sha256:{}", "0".repeat(64)))
            .build()
            .unwrap();
        let layer_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .size(2i64)
            .digest(format!("sha256:{}", "1".repeat(64)))
            .build()
            .unwrap();
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(vec![layer_descriptor])
            .annotations(annotations)
            .build()
            .unwrap();
        let err = validate_image_manifest(&manifest).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn add_layer_to_config_appends_diff_id_and_history() {
        let generator = ManifestGenerator::new();
        let platform = Platform::new("amd64", "linux");
        let mut config = generator
            .generate_image_config(&[], &platform, &fixed_options())
            .unwrap();
        let mut engine = LayerEngine::new();
        let layer = engine
            .create_layer(Vec::new(), &LayerConfig::default().with_skip_empty(true))
            .unwrap()
            .with_created_by("FROM scratch");
        generator.add_layer_to_config(&mut config, &layer).unwrap();
        assert!(config.rootfs().diff_ids().is_empty());
        let last = config.configuration.history().last().unwrap();
        assert_eq!(last.created_by().as_deref(), Some("FROM scratch"));
        assert_eq!(last.empty_layer(), Some(true));
    }

    #[test]
    fn add_layer_to_config_pushes_diff_id_for_real_layer() {
        let generator = ManifestGenerator::new();
        let platform = Platform::new("amd64", "linux");
        let mut config = generator
            .generate_image_config(&[], &platform, &fixed_options())
            .unwrap();
        let mut engine = LayerEngine::new();
        let layer = engine
            .create_layer(
                vec![crate::change::memory_file_change(
                    "/a.txt",
                    crate::change::ChangeType::Add,
                    0o644,
                    0,
                    0,
                    1_700_000_000,
                    b"x".to_vec(),
                )],
                &LayerConfig::default().with_compression(Compression::None),
            )
            .unwrap();
        generator.add_layer_to_config(&mut config, &layer).unwrap();
        assert_eq!(config.rootfs().diff_ids(), &vec![layer.digest().to_string()]);
    }

    #[test]
    fn generate_image_manifest_omits_empty_layer_markers() {
        let generator = ManifestGenerator::new();
        let platform = Platform::new("amd64", "linux");
        let config = generator
            .generate_image_config(&base_instructions(), &platform, &fixed_options())
            .unwrap();
        let mut engine = LayerEngine::new();
        let empty_layer = engine
            .create_layer(Vec::new(), &LayerConfig::default().with_skip_empty(true))
            .unwrap();
        let real_layer = engine
            .create_layer(
                vec![crate::change::memory_file_change(
                    "/a.txt",
                    crate::change::ChangeType::Add,
                    0o644,
                    0,
                    0,
                    1_700_000_000,
                    b"x".to_vec(),
                )],
                &LayerConfig::default().with_compression(Compression::None),
            )
            .unwrap();
        let manifest = generator
            .generate_image_manifest(&config, &[empty_layer, real_layer.clone()])
            .unwrap();
        assert_eq!(manifest.layers().len(), 1);
        assert_eq!(manifest.layers()[0].digest(), real_layer.digest());
    }
}
