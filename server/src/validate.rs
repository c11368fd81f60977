//! Upload coordinate and filename grammars.
//!
//! Validation happens before any filesystem mutation; nothing with an
//! invalid distro path or filename ever reaches the temp or staging trees.

use std::fmt;

use lazy_regex::regex_is_match;
use serde::Serialize;

/// Flavor of a package repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Deb,
    Rpm,
}

impl RepoType {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoType::Deb => "deb",
            RepoType::Rpm => "rpm",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate the full target-path components (distro, release, and for Debian
/// one or two components) against the per-type grammar.
pub fn validate_distro(repo: RepoType, parts: &[String]) -> bool {
    let [distro, release, components @ ..] = parts else {
        return false;
    };
    match repo {
        RepoType::Deb => {
            regex_is_match!(r"^[a-z]+$", distro)
                && regex_is_match!(r"^[a-z][a-z-]*$", release)
                && !components.is_empty()
                && components.len() <= 2
                && components
                    .iter()
                    .all(|component| regex_is_match!(r"^[a-z0-9][a-z0-9-]*$", component))
        }
        RepoType::Rpm => {
            regex_is_match!(r"^[a-z]+$", distro)
                && regex_is_match!(r"^[0-9]+$", release)
                && components.is_empty()
        }
    }
}

/// Validate an uploaded filename's extension grammar for the repo type.
pub fn validate_filename(repo: RepoType, filename: &str) -> bool {
    match repo {
        RepoType::Deb => regex_is_match!(
            r"^[a-z0-9][a-z0-9.+~_-]*\.(deb|tar\.[^.]+|buildinfo|changes|dsc|ddeb|udeb)$",
            filename
        ),
        RepoType::Rpm => regex_is_match!(r"^[a-zA-Z0-9][a-zA-Z0-9.+_-]*\.rpm$", filename),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn deb_distro_grammar() {
        assert!(validate_distro(
            RepoType::Deb,
            &parts(&["debian", "bookworm", "main"])
        ));
        assert!(validate_distro(
            RepoType::Deb,
            &parts(&["ubuntu", "noble-updates", "main", "sub0"])
        ));
        // Components may not contain dots.
        assert!(!validate_distro(
            RepoType::Deb,
            &parts(&["debian", "bookworm", "test.main"])
        ));
        // A component is required.
        assert!(!validate_distro(RepoType::Deb, &parts(&["debian", "bookworm"])));
        // At most two components.
        assert!(!validate_distro(
            RepoType::Deb,
            &parts(&["debian", "bookworm", "a", "b", "c"])
        ));
        assert!(!validate_distro(
            RepoType::Deb,
            &parts(&["Debian", "bookworm", "main"])
        ));
        assert!(!validate_distro(
            RepoType::Deb,
            &parts(&["debian", "Bookworm", "main"])
        ));
    }

    #[test]
    fn rpm_distro_grammar() {
        assert!(validate_distro(RepoType::Rpm, &parts(&["fedora", "41"])));
        assert!(!validate_distro(RepoType::Rpm, &parts(&["fedora", "rawhide"])));
        assert!(!validate_distro(
            RepoType::Rpm,
            &parts(&["fedora", "41", "main"])
        ));
        assert!(!validate_distro(RepoType::Rpm, &parts(&["fedora"])));
    }

    #[test]
    fn deb_filename_grammar() {
        for ok in [
            "pkg_1.0-1_amd64.deb",
            "pkg_1.0.orig.tar.xz",
            "pkg_1.0-1.dsc",
            "pkg_1.0-1_amd64.changes",
            "pkg_1.0-1_amd64.buildinfo",
            "pkg-dbgsym_1.0-1_amd64.ddeb",
            "pkg_1.0-1_amd64.udeb",
            "pkg~beta_1.0.tar.gz",
        ] {
            assert!(validate_filename(RepoType::Deb, ok), "{ok} should pass");
        }
        for bad in [
            "Pkg_1.0.deb",
            "pkg_1.0.rpm",
            "pkg_1.0.tar.",
            ".hidden.deb",
            "pkg/../evil.deb",
            "pkg_1.0.exe",
        ] {
            assert!(!validate_filename(RepoType::Deb, bad), "{bad} should fail");
        }
    }

    #[test]
    fn rpm_filename_grammar() {
        assert!(validate_filename(RepoType::Rpm, "Pkg-1.0-1.x86_64.rpm"));
        assert!(validate_filename(RepoType::Rpm, "pkg-1.0+git1-1.noarch.rpm"));
        assert!(!validate_filename(RepoType::Rpm, "pkg-1.0-1.x86_64.deb"));
        assert!(!validate_filename(RepoType::Rpm, "~pkg.rpm"));
        assert!(!validate_filename(RepoType::Rpm, "pkg~1.rpm"));
    }
}
