//! The sectioned key/value configuration grammar shared by the image
//! configuration file and the fleet configuration file (spec.md §6).
//!
//! Grounded on `nagoya/cli/cfg.py`'s `read_one`/`read_config` (per-file
//! `{cfgdir}`/`{section}`/`{secdir}` placeholder expansion, later files in a
//! `--config` list overriding earlier ones by section) and on
//! `nagoya/moromi.py`'s `optional_plural`/`parse_dir_spec` grammar for
//! multi-line values and `"SOURCE in DIR"`/`"SOURCE at PATH"` resource
//! specs. Rather than Python's `ConfigParser`, this module hand-rolls the
//! subset of INI actually used: `[section]` headers, `key = value` (or
//! `key: value`) lines, and indented continuation lines folded into the
//! previous key's value with a `\n` join — equivalent to what
//! `ConfigParser` + `str.split("\n")` produces together.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use stacked_errors::{bail_locationless, Result, StackableErr};

use crate::{
    container::{Callspec, NetworkLink, VolumeFromLink, VolumeLink},
    error::OrchestratorError,
};

pub type Section = BTreeMap<String, String>;

/// A parsed (but not yet placeholder-expanded) configuration file: section
/// declaration order plus each section's key/value pairs.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub order: Vec<String>,
    pub sections: BTreeMap<String, Section>,
}

/// Parses the sectioned key/value grammar. Blank lines and lines starting
/// with `#` or `;` are ignored. A line beginning with whitespace continues
/// the previous key's value (joined with `\n`), matching `ConfigParser`'s
/// continuation-line convention.
pub fn parse_ini(text: &str) -> Result<RawConfig> {
    let mut cfg = RawConfig::default();
    let mut current_section: Option<String> = None;
    let mut current_key: Option<String> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let lineno = lineno + 1;
        if raw_line.trim().is_empty() {
            current_key = None;
            continue;
        }
        let trimmed_start = raw_line.trim_start();
        if trimmed_start.starts_with('#') || trimmed_start.starts_with(';') {
            continue;
        }

        let is_continuation = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        if is_continuation && current_key.is_some() && current_section.is_some() {
            let section = current_section.as_ref().unwrap();
            let key = current_key.as_ref().unwrap();
            let entry = cfg
                .sections
                .get_mut(section)
                .and_then(|s| s.get_mut(key))
                .stack_err_with_locationless(|| {
                    format!("parse_ini -> line {lineno}: continuation with no preceding key")
                })?;
            entry.push('\n');
            entry.push_str(trimmed_start.trim_end());
            continue;
        }

        let line = raw_line.trim();
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let name = name.trim().to_owned();
            if !cfg.sections.contains_key(&name) {
                cfg.order.push(name.clone());
            }
            cfg.sections.entry(name.clone()).or_default();
            current_section = Some(name);
            current_key = None;
            continue;
        }

        let section = current_section.as_ref().stack_err_with_locationless(|| {
            format!("parse_ini -> line {lineno}: key/value line before any [section] header")
        })?;
        let (key, value) = split_key_value(line).stack_err_with_locationless(|| {
            format!("parse_ini -> line {lineno}: malformed key/value line {line:?}")
        })?;
        cfg.sections
            .get_mut(section)
            .expect("section inserted above")
            .insert(key.clone(), value);
        current_key = Some(key);
    }

    Ok(cfg)
}

fn split_key_value(line: &str) -> Result<(String, String)> {
    let eq = line.find('=');
    let colon = line.find(':');
    let idx = match (eq, colon) {
        (Some(e), Some(c)) => e.min(c),
        (Some(e), None) => e,
        (None, Some(c)) => c,
        (None, None) => bail_locationless!("missing '=' or ':' separating key from value"),
    };
    let (key, value) = line.split_at(idx);
    Ok((key.trim().to_owned(), value[1..].trim().to_owned()))
}

/// Expands `{cfgdir}`, `{section}`, `{secdir}` in every value of `cfg`,
/// rooted at `cfg_file_dir` — the directory containing *this* config file,
/// per spec.md §9's "expansion is per-file" guidance.
pub fn expand_placeholders(cfg: &mut RawConfig, cfg_file_dir: &Path) {
    let cfgdir = cfg_file_dir.to_string_lossy().into_owned();
    for (section_name, section) in cfg.sections.iter_mut() {
        let secdir = cfg_file_dir.join(section_name).to_string_lossy().into_owned();
        for value in section.values_mut() {
            *value = value
                .replace("{cfgdir}", &cfgdir)
                .replace("{section}", section_name)
                .replace("{secdir}", &secdir);
        }
    }
}

/// Splits a multi-line config value into its (trimmed) lines, dropping
/// blank lines. Mirrors `optional_plural`/`line_split`.
pub fn multi_line(value: &str) -> Vec<String> {
    value
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses one of the fixed boolean-valued keys (`detach`, `run_once`,
/// `multiple`, `commit`).
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(OrchestratorError::Configuration(format!(
            "unknown boolean literal {other:?}, expected true/false, 1/0, or yes/no"
        )))
        .stack_err_locationless("parse_bool"),
    }
}

/// The resolved source/destination pair for a `libs`/`runs`/`entrypoint`
/// resource, per `"SOURCE in DIR"` or `"SOURCE at PATH"` (spec.md §8.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSpec {
    pub src_path: PathBuf,
    /// Full destination path inside the image/container.
    pub dest_path: String,
    /// The directory component of `dest_path` — the working directory an
    /// entrypoint/run step executes from.
    pub dest_dir: String,
}

impl DirSpec {
    /// Parses `"SOURCE in DIR"` (destination is `DIR/basename(SOURCE)`) or
    /// `"SOURCE at PATH"` (destination is `PATH` exactly). Greedy like the
    /// original's regex: when both `" in "` and `" at "` appear, the
    /// rightmost one is the separator, so source paths may themselves
    /// contain either substring as long as it isn't the true separator.
    pub fn parse(text: &str) -> Result<Self> {
        let in_idx = text.rfind(" in ");
        let at_idx = text.rfind(" at ");
        let (src, dest_dir, dest_path) = match (in_idx, at_idx) {
            (None, None) => bail_locationless!(
                "DirSpec::parse({text:?}) -> expected \"SOURCE in DIR\" or \"SOURCE at PATH\""
            ),
            (Some(i), other) if other.map(|a| i > a).unwrap_or(true) => {
                let src = text[..i].trim();
                let dir = text[i + 4..].trim();
                let basename = Path::new(src)
                    .file_name()
                    .stack_err_with_locationless(|| {
                        format!("DirSpec::parse({text:?}) -> source has no basename")
                    })?
                    .to_string_lossy()
                    .into_owned();
                let dest = format!("{}/{}", dir.trim_end_matches('/'), basename);
                (src, dir.to_owned(), dest)
            }
            (_, Some(a)) => {
                let src = text[..a].trim();
                let path = text[a + 4..].trim();
                let dir = Path::new(path)
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (src, dir, path.to_owned())
            }
            _ => unreachable!(),
        };
        Ok(Self {
            src_path: PathBuf::from(src),
            dest_path,
            dest_dir,
        })
    }
}

/// Parses `"CONTAINER to IMAGE"` (the `commits`/`persists` grammar).
pub fn parse_to_pair(text: &str) -> Result<(String, String)> {
    let (name, image) = text.split_once(" to ").stack_err_with_locationless(|| {
        format!("parse_to_pair({text:?}) -> expected \"CONTAINER to IMAGE\"")
    })?;
    Ok((name.trim().to_owned(), image.trim().to_owned()))
}

/// One image's build specification, as found under a single `[section]` of
/// an image configuration file.
#[derive(Debug, Clone)]
pub enum ImageSpec {
    Single(SingleImageSpec),
    ContainerSystem(ContainerSystemImageSpec),
}

#[derive(Debug, Clone, Default)]
pub struct SingleImageSpec {
    pub from: String,
    pub maintainer: Option<String>,
    pub exposes: Vec<String>,
    pub volumes: Vec<String>,
    pub envs: BTreeMap<String, String>,
    pub libs: Vec<DirSpec>,
    pub runs: Vec<DirSpec>,
    pub entrypoint: Option<DirSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSystemImageSpec {
    pub system: PathBuf,
    pub root: String,
    pub entrypoint: Option<DirSpec>,
    pub libs: Vec<DirSpec>,
    pub commits: Vec<(String, String)>,
    pub persists: Vec<(String, String)>,
}

/// The fully parsed image configuration file: declaration order (used by
/// the Planner as the level-local tie-break) plus each section's spec.
#[derive(Debug, Clone, Default)]
pub struct ImageConfigFile {
    pub order: Vec<String>,
    pub images: BTreeMap<String, ImageSpec>,
}

const CONTAINER_SYSTEM_KEYS: &[&str] = &["system", "root", "commits", "persists"];

/// Parses a single already-expanded image config file's sections into
/// [`ImageSpec`]s, classifying a section as a container-system spec iff it
/// carries any of [`CONTAINER_SYSTEM_KEYS`].
pub fn parse_image_config(cfg: &RawConfig) -> Result<ImageConfigFile> {
    let mut images = BTreeMap::new();
    for name in &cfg.order {
        let section = &cfg.sections[name];
        let spec = if CONTAINER_SYSTEM_KEYS.iter().any(|k| section.contains_key(*k)) {
            ImageSpec::ContainerSystem(parse_container_system_spec(name, section)?)
        } else {
            ImageSpec::Single(parse_single_image_spec(name, section)?)
        };
        images.insert(name.clone(), spec);
    }
    Ok(ImageConfigFile {
        order: cfg.order.clone(),
        images,
    })
}

fn parse_single_image_spec(name: &str, section: &Section) -> Result<SingleImageSpec> {
    let from = section
        .get("from")
        .stack_err_with_locationless(|| format!("image {name:?} -> missing required key 'from'"))?
        .clone();
    let mut envs = BTreeMap::new();
    if let Some(v) = section.get("envs") {
        for line in multi_line(v) {
            let (k, val) = line.split_once('=').stack_err_with_locationless(|| {
                format!("image {name:?} -> malformed envs entry {line:?}, expected K=V")
            })?;
            envs.insert(k.trim().to_owned(), val.trim().to_owned());
        }
    }
    let libs = section
        .get("libs")
        .map(|v| multi_line(v))
        .unwrap_or_default()
        .iter()
        .map(|l| DirSpec::parse(l))
        .collect::<Result<Vec<_>>>()
        .stack_err_with_locationless(|| format!("image {name:?} -> libs"))?;
    let runs = section
        .get("runs")
        .map(|v| multi_line(v))
        .unwrap_or_default()
        .iter()
        .map(|l| DirSpec::parse(l))
        .collect::<Result<Vec<_>>>()
        .stack_err_with_locationless(|| format!("image {name:?} -> runs"))?;
    let entrypoint = section
        .get("entrypoint")
        .map(|v| DirSpec::parse(v))
        .transpose()
        .stack_err_with_locationless(|| format!("image {name:?} -> entrypoint"))?;
    Ok(SingleImageSpec {
        from,
        maintainer: section.get("maintainer").cloned(),
        exposes: section.get("exposes").map(|v| multi_line(v)).unwrap_or_default(),
        volumes: section.get("volumes").map(|v| multi_line(v)).unwrap_or_default(),
        envs,
        libs,
        runs,
        entrypoint,
    })
}

fn parse_container_system_spec(name: &str, section: &Section) -> Result<ContainerSystemImageSpec> {
    let system = section
        .get("system")
        .stack_err_with_locationless(|| format!("image {name:?} -> missing required key 'system'"))?;
    let root = section
        .get("root")
        .stack_err_with_locationless(|| format!("image {name:?} -> missing required key 'root'"))?
        .clone();
    let entrypoint = section
        .get("entrypoint")
        .map(|v| DirSpec::parse(v))
        .transpose()
        .stack_err_with_locationless(|| format!("image {name:?} -> entrypoint"))?;
    let libs = section
        .get("libs")
        .map(|v| multi_line(v))
        .unwrap_or_default()
        .iter()
        .map(|l| DirSpec::parse(l))
        .collect::<Result<Vec<_>>>()
        .stack_err_with_locationless(|| format!("image {name:?} -> libs"))?;
    let commits = section
        .get("commits")
        .map(|v| multi_line(v))
        .unwrap_or_default()
        .iter()
        .map(|l| parse_to_pair(l))
        .collect::<Result<Vec<_>>>()
        .stack_err_with_locationless(|| format!("image {name:?} -> commits"))?;
    let persists = section
        .get("persists")
        .map(|v| multi_line(v))
        .unwrap_or_default()
        .iter()
        .map(|l| parse_to_pair(l))
        .collect::<Result<Vec<_>>>()
        .stack_err_with_locationless(|| format!("image {name:?} -> persists"))?;
    Ok(ContainerSystemImageSpec {
        system: PathBuf::from(system),
        root,
        entrypoint,
        libs,
        commits,
        persists,
    })
}

/// One container's declaration within a fleet configuration file, prior to
/// being turned into a [`crate::container::ContainerSpec`] (which needs a
/// resolved name and a daemon handle this module doesn't have).
#[derive(Debug, Clone)]
pub struct FleetContainerConfig {
    pub image: String,
    pub detach: bool,
    pub run_once: bool,
    pub volumes: Vec<VolumeLink>,
    pub volumes_from: Vec<VolumeFromLink>,
    pub links: Vec<NetworkLink>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub callbacks: Vec<Callspec>,
}

#[derive(Debug, Clone, Default)]
pub struct FleetConfigFile {
    pub order: Vec<String>,
    pub containers: BTreeMap<String, FleetContainerConfig>,
}

/// Parses a fleet configuration file's sections (already placeholder
/// expanded) into [`FleetContainerConfig`]s, keyed by container name (the
/// section name).
pub fn parse_fleet_config(cfg: &RawConfig) -> Result<FleetConfigFile> {
    let mut containers = BTreeMap::new();
    for name in &cfg.order {
        let section = &cfg.sections[name];
        let image = section
            .get("image")
            .stack_err_with_locationless(|| format!("container {name:?} -> missing required key 'image'"))?
            .clone();
        let detach = section
            .get("detach")
            .map(|v| parse_bool(v))
            .transpose()
            .stack_err_with_locationless(|| format!("container {name:?} -> detach"))?
            .unwrap_or(true);
        let run_once = section
            .get("run_once")
            .map(|v| parse_bool(v))
            .transpose()
            .stack_err_with_locationless(|| format!("container {name:?} -> run_once"))?
            .unwrap_or(false);
        // `multiple` is accepted but intentionally has no observable effect
        // (spec.md §9 Open Question).
        let volumes = section
            .get("volumes")
            .map(|v| multi_line(v))
            .unwrap_or_default()
            .iter()
            .map(|l| VolumeLink::from_text(l))
            .collect::<Result<Vec<_>>>()
            .stack_err_with_locationless(|| format!("container {name:?} -> volumes"))?;
        let volumes_from = section
            .get("volumes_from")
            .map(|v| multi_line(v))
            .unwrap_or_default()
            .iter()
            .map(|l| VolumeFromLink::from_text(l))
            .collect::<Result<Vec<_>>>()
            .stack_err_with_locationless(|| format!("container {name:?} -> volumes_from"))?;
        let links = section
            .get("links")
            .map(|v| multi_line(v))
            .unwrap_or_default()
            .iter()
            .map(|l| NetworkLink::from_text(l))
            .collect::<Result<Vec<_>>>()
            .stack_err_with_locationless(|| format!("container {name:?} -> links"))?;
        let entrypoint = section
            .get("entrypoint")
            .map(|v| v.split_whitespace().map(str::to_owned).collect());
        let callbacks = section
            .get("callbacks")
            .map(|v| multi_line(v))
            .unwrap_or_default()
            .iter()
            .map(|l| Callspec::parse(l))
            .collect::<Result<Vec<_>>>()
            .stack_err_with_locationless(|| format!("container {name:?} -> callbacks"))?;
        containers.insert(
            name.clone(),
            FleetContainerConfig {
                image,
                detach,
                run_once,
                volumes,
                volumes_from,
                links,
                entrypoint,
                working_dir: section.get("working_dir").cloned(),
                callbacks,
            },
        );
    }
    Ok(FleetConfigFile {
        order: cfg.order.clone(),
        containers,
    })
}

/// Reads and parses a config file at `path`, expanding placeholders
/// relative to its own containing directory.
pub async fn read_and_parse(path: &Path) -> Result<RawConfig> {
    let text = crate::file_options::FileOptions::read_to_string(path)
        .await
        .stack_err_with_locationless(|| format!("read_and_parse({path:?})"))?;
    let mut cfg = parse_ini(&text).stack_err_with_locationless(|| format!("read_and_parse({path:?})"))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    expand_placeholders(&mut cfg, dir);
    Ok(cfg)
}

/// Merges `other` into `base`, section-by-section (a later file's section
/// fully replaces an earlier file's section of the same name), matching
/// the `--config` repeatable-flag semantics in spec.md §6.
pub fn merge_raw(base: &mut RawConfig, other: RawConfig) {
    for name in other.order {
        if !base.sections.contains_key(&name) {
            base.order.push(name.clone());
        }
        let section = other.sections.get(&name).cloned().unwrap_or_default();
        base.sections.insert(name, section);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_continuations() {
        let text = "[a]\nfrom = base:latest\nexposes = 80\n    443\n\n[b]\nimage = busybox\n";
        let cfg = parse_ini(text).unwrap();
        assert_eq!(cfg.order, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cfg.sections["a"]["from"], "base:latest");
        assert_eq!(cfg.sections["a"]["exposes"], "80\n443");
        assert_eq!(cfg.sections["b"]["image"], "busybox");
    }

    #[test]
    fn expands_placeholders_per_file() {
        let text = "[sec]\nlibs = {cfgdir}/lib.py in {secdir}\n";
        let mut cfg = parse_ini(text).unwrap();
        expand_placeholders(&mut cfg, Path::new("/etc/images"));
        assert_eq!(
            cfg.sections["sec"]["libs"],
            "/etc/images/lib.py in /etc/images/sec"
        );
    }

    #[test]
    fn dir_spec_in_form() {
        let d = DirSpec::parse("P/a.py in /x").unwrap();
        assert_eq!(d.dest_path, "/x/a.py");
        assert_eq!(d.dest_dir, "/x");
    }

    #[test]
    fn dir_spec_at_form() {
        let d = DirSpec::parse("P/a.py at /x/b.py").unwrap();
        assert_eq!(d.dest_path, "/x/b.py");
        assert_eq!(d.dest_dir, "/x");
    }

    #[test]
    fn dir_spec_rejects_garbage() {
        assert!(DirSpec::parse("just a path").is_err());
    }

    #[test]
    fn parses_to_pair() {
        assert_eq!(
            parse_to_pair("root to image:final").unwrap(),
            ("root".to_string(), "image:final".to_string())
        );
    }

    #[test]
    fn parses_single_image_spec() {
        let text = "[foo]\nfrom = base\nmaintainer = me\nexposes = 80\nenvs = A=1\n    B=2\n";
        let cfg = parse_ini(text).unwrap();
        let images = parse_image_config(&cfg).unwrap();
        match &images.images["foo"] {
            ImageSpec::Single(s) => {
                assert_eq!(s.from, "base");
                assert_eq!(s.envs["A"], "1");
                assert_eq!(s.envs["B"], "2");
            }
            _ => panic!("expected single-image spec"),
        }
    }

    #[test]
    fn classifies_container_system_spec() {
        let text = "[foo]\nsystem = fleet.cfg\nroot = image:root\npersists = data to image:snap\n";
        let cfg = parse_ini(text).unwrap();
        let images = parse_image_config(&cfg).unwrap();
        match &images.images["foo"] {
            ImageSpec::ContainerSystem(s) => {
                assert_eq!(s.root, "image:root");
                assert_eq!(s.persists, vec![("data".to_string(), "image:snap".to_string())]);
            }
            _ => panic!("expected container-system spec"),
        }
    }

    #[test]
    fn parses_fleet_config() {
        let text = "[root]\nimage = alpha\nlinks = dep:dep\n\n[dep]\nimage = beta\ndetach = true\n";
        let cfg = parse_ini(text).unwrap();
        let fleet_cfg = parse_fleet_config(&cfg).unwrap();
        assert_eq!(fleet_cfg.containers["root"].image, "alpha");
        assert_eq!(fleet_cfg.containers["root"].links[0].container_name, "dep");
        assert!(fleet_cfg.containers["dep"].detach);
    }
}
