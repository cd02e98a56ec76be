//! The Image Build Planner: resolves a dependency-respecting build order
//! across a whole image configuration file.
//!
//! Unlike the other components, there is no original-source file that
//! implements this cross-image resolution (`deps.py` in the retrieval pack
//! turns out to be an unrelated module-dependency fetcher). This module is
//! grounded instead on [`crate::fleet::Fleet::find_sync_groups`]'s own
//! Kahn's-algorithm shape, adapted from a leveled sync-group computation to
//! a single flat, declaration-order-tie-broken total order, since a build
//! plan is a sequence of images to build one after another rather than
//! groups to run concurrently.

use std::collections::{BTreeMap, BTreeSet};

use stacked_errors::{Result, StackableErr};

use crate::{
    config::{FleetConfigFile, ImageConfigFile, ImageSpec},
    error::OrchestratorError,
};

/// A dependency-resolved (or caller-overridden) sequence of image names to
/// build, in the order they should be built.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub order: Vec<String>,
}

/// Resolves the build order for `images`. `fleet_configs` must already
/// contain the parsed fleet configuration for every container-system image
/// in `images` (keyed by image section name) — the planner does no file
/// I/O itself. When `explicit` is given, it is used as-is and no
/// dependency resolution is performed (spec.md §4.7).
pub fn build_plan(
    images: &ImageConfigFile,
    fleet_configs: &BTreeMap<String, FleetConfigFile>,
    explicit: Option<&[String]>,
) -> Result<BuildPlan> {
    if let Some(list) = explicit {
        return Ok(BuildPlan {
            order: list.to_vec(),
        });
    }

    let provided_by = provision_map(images);
    let deps = dependency_graph(images, fleet_configs, &provided_by);
    let order = topo_sort(&images.order, &deps)
        .stack_err_locationless("build_plan -> resolving image dependency order")?;
    Ok(BuildPlan { order })
}

/// Maps every image reference a declared section "provides" back to that
/// section's name: a single-image spec provides only its own section name;
/// a container-system spec additionally provides every commit/persist
/// destination. When two sections provide the same reference, the
/// earliest-declared one wins (spec.md §9 leaves the collision case
/// undefined; this is the specific tie-break chosen here).
fn provision_map(images: &ImageConfigFile) -> BTreeMap<String, String> {
    let mut provided_by = BTreeMap::new();
    for name in &images.order {
        let mut provided = vec![name.clone()];
        if let ImageSpec::ContainerSystem(cs) = &images.images[name] {
            provided.extend(cs.commits.iter().map(|(_, dest)| dest.clone()));
            provided.extend(cs.persists.iter().map(|(_, dest)| dest.clone()));
        }
        for reference in provided {
            provided_by.entry(reference).or_insert_with(|| name.clone());
        }
    }
    provided_by
}

/// Resolves `image_ref` against the provision map, trying the reference
/// verbatim first and then with any `:tag` suffix stripped (the "name
/// portion" spec.md §4.7 describes for a single-image spec's `from`).
fn resolve_local_provider(image_ref: &str, provided_by: &BTreeMap<String, String>) -> Option<String> {
    if let Some(section) = provided_by.get(image_ref) {
        return Some(section.clone());
    }
    let (name_portion, _) = image_ref.split_once(':').unwrap_or((image_ref, ""));
    provided_by.get(name_portion).cloned()
}

fn dependency_graph(
    images: &ImageConfigFile,
    fleet_configs: &BTreeMap<String, FleetConfigFile>,
    provided_by: &BTreeMap<String, String>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut deps = BTreeMap::new();
    for name in &images.order {
        let mut dep_set = BTreeSet::new();
        match &images.images[name] {
            ImageSpec::Single(single) => {
                if let Some(dep) = resolve_local_provider(&single.from, provided_by) {
                    if dep != *name {
                        dep_set.insert(dep);
                    }
                }
            }
            ImageSpec::ContainerSystem(_) => {
                if let Some(fleet_cfg) = fleet_configs.get(name) {
                    for container in fleet_cfg.containers.values() {
                        if let Some(dep) = resolve_local_provider(&container.image, provided_by) {
                            if dep != *name {
                                dep_set.insert(dep);
                            }
                        }
                    }
                }
            }
        }
        deps.insert(name.clone(), dep_set);
    }
    deps
}

/// Lexicographic topological sort: repeatedly scans `declared_order` and
/// places the next not-yet-placed name whose dependencies are already
/// placed, in declaration order. Produces a deterministic total order that
/// both respects the DAG and uses declaration order as the tie-break among
/// mutually-independent images.
fn topo_sort(declared_order: &[String], deps: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut order = Vec::with_capacity(declared_order.len());
    while placed.len() < declared_order.len() {
        let mut progressed = false;
        for name in declared_order {
            if placed.contains(name) {
                continue;
            }
            if deps[name].iter().all(|d| placed.contains(d)) {
                order.push(name.clone());
                placed.insert(name.clone());
                progressed = true;
            }
        }
        if !progressed {
            let members: Vec<String> = declared_order
                .iter()
                .filter(|n| !placed.contains(*n))
                .cloned()
                .collect();
            return Err(OrchestratorError::Cycle { members })
                .stack_err_locationless("topo_sort -> dependency cycle among images");
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_fleet_config, parse_image_config, parse_ini};

    #[test]
    fn independent_images_build_in_declaration_order() {
        let text = "[a]\nfrom = scratch\n\n[b]\nfrom = scratch\n";
        let raw = parse_ini(text).unwrap();
        let images = parse_image_config(&raw).unwrap();
        let plan = build_plan(&images, &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn dependent_single_image_builds_after_its_base() {
        // S6: configuration {img1 from img2; img2 from scratch}
        let text = "[img1]\nfrom = img2\n\n[img2]\nfrom = scratch\n";
        let raw = parse_ini(text).unwrap();
        let images = parse_image_config(&raw).unwrap();
        let plan = build_plan(&images, &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.order, vec!["img2".to_string(), "img1".to_string()]);
    }

    #[test]
    fn unlocalized_base_image_has_no_dependency() {
        let text = "[img1]\nfrom = some/external:tag\n";
        let raw = parse_ini(text).unwrap();
        let images = parse_image_config(&raw).unwrap();
        let plan = build_plan(&images, &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.order, vec!["img1".to_string()]);
    }

    #[test]
    fn container_system_depends_on_locally_provided_container_images() {
        let image_text = "[base]\nfrom = scratch\n\n[system]\nsystem = fleet.cfg\nroot = base\n";
        let raw = parse_ini(image_text).unwrap();
        let images = parse_image_config(&raw).unwrap();

        let fleet_text = "[root]\nimage = base\n";
        let fleet_raw = parse_ini(fleet_text).unwrap();
        let fleet_cfg = parse_fleet_config(&fleet_raw).unwrap();
        let mut fleet_configs = BTreeMap::new();
        fleet_configs.insert("system".to_string(), fleet_cfg);

        let plan = build_plan(&images, &fleet_configs, None).unwrap();
        assert_eq!(plan.order, vec!["base".to_string(), "system".to_string()]);
    }

    #[test]
    fn cycle_among_images_is_rejected() {
        let text = "[a]\nfrom = b\n\n[b]\nfrom = a\n";
        let raw = parse_ini(text).unwrap();
        let images = parse_image_config(&raw).unwrap();
        assert!(build_plan(&images, &BTreeMap::new(), None).is_err());
    }

    #[test]
    fn explicit_list_skips_dependency_resolution() {
        let text = "[a]\nfrom = b\n\n[b]\nfrom = a\n"; // would otherwise be a cycle
        let raw = parse_ini(text).unwrap();
        let images = parse_image_config(&raw).unwrap();
        let explicit = vec!["b".to_string(), "a".to_string()];
        let plan = build_plan(&images, &BTreeMap::new(), Some(&explicit)).unwrap();
        assert_eq!(plan.order, explicit);
    }
}
