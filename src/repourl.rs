//! Repository URL template lookup and substitution.
//!
//! A repository name maps to a URL template through a precedence-ordered
//! search: a user override in the `repository-urls` group of the user
//! state wins, then the repository template sections selected by the
//! repository kind (RND repositories search `<flavour>-flavour`, `rnd`,
//! `all`; release repositories search `release`, `all`). The template is
//! then substituted with an assembled variable map.
//!
//! RND repos have a flavour (devel, testing, release) and a release
//! (latest, next); release repos only have a release (latest, next, or a
//! version number).

use std::collections::HashMap;

use crate::config::ConfigStore;

/// Inputs the resolver needs beyond the repository name itself.
pub struct RepoContext<'a> {
    /// User state plane (variables, overrides, release/arch/adaptation).
    pub settings: &'a ConfigStore,
    /// Repository template plane.
    pub templates: &'a ConfigStore,
    /// Currently selected flavour.
    pub flavour: &'a str,
    /// Discovered device model.
    pub device_model: &'a str,
    /// Discovered device family.
    pub device_family: &'a str,
}

/// Resolve `repo_name` into a fully substituted URL.
///
/// Returns the empty string when no template exists for the name; callers
/// detect the empty URL.
pub fn resolve(
    ctx: &RepoContext<'_>,
    repo_name: &str,
    rnd: bool,
    extra: HashMap<String, String>,
) -> String {
    let mut vars: HashMap<String, String> = HashMap::new();

    // Arbitrary variables configured by the user come first so that the
    // caller and the computed values below can override them.
    for key in ctx.settings.keys("repository-url-variables") {
        let value = ctx
            .settings
            .get("repository-url-variables", &key)
            .unwrap_or_default();
        vars.insert(key, value.to_string());
    }
    vars.extend(extra);

    let sections: Vec<String> = if rnd {
        let flavour_group = format!("{}-flavour", ctx.flavour);
        vars.insert(
            "flavour".to_string(),
            ctx.templates
                .get(&flavour_group, "flavour-pattern")
                .unwrap_or_default()
                .to_string(),
        );
        vars.insert(
            "release".to_string(),
            ctx.settings.get("", "rndRelease").unwrap_or_default().to_string(),
        );
        vec![flavour_group, "rnd".to_string(), "all".to_string()]
    } else {
        vars.insert(
            "release".to_string(),
            ctx.settings.get("", "release").unwrap_or_default().to_string(),
        );
        vec!["release".to_string(), "all".to_string()]
    };

    vars.entry("debugSplit".to_string())
        .or_insert_with(|| "packages".to_string());
    vars.entry("arch".to_string()).or_insert_with(|| {
        ctx.settings.get("", "arch").unwrap_or_default().to_string()
    });

    vars.insert(
        "adaptation".to_string(),
        ctx.settings.get("", "adaptation").unwrap_or_default().to_string(),
    );
    vars.insert("deviceFamily".to_string(), ctx.device_family.to_string());
    vars.insert("deviceModel".to_string(), ctx.device_model.to_string());

    let template = ctx
        .settings
        .get("repository-urls", repo_name)
        .map(str::to_string)
        .or_else(|| {
            sections
                .iter()
                .find_map(|section| ctx.templates.get(section, repo_name))
                .map(str::to_string)
        })
        .unwrap_or_default();

    substitute(&template, &vars)
}

/// Replace every `%(name)` token in `template` with the value of `name`.
///
/// Single left-to-right pass; replacement values are not re-scanned, so
/// substitution never expands recursively. Unknown tokens are kept
/// verbatim.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after_marker = &rest[start + 2..];
        match after_marker.find(')') {
            Some(end) => {
                let name = &after_marker[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated token, keep the tail as-is.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
