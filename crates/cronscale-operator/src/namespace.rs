//! This module provides helpers to deal with the namespaces a control loop is responsible for.
use std::{fmt::Display, str::FromStr};

use serde::Serialize;

/// The scope of one control loop instance.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl Display for WatchNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("<cluster>"),
            Self::One(namespace) => f.write_str(namespace),
        }
    }
}

/// A comma separated list of namespaces, each of which gets its own control loop. An empty list
/// means a single cluster-wide loop.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WatchNamespaces(Vec<String>);

impl FromStr for WatchNamespaces {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut namespaces: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|namespace| !namespace.is_empty())
            .map(str::to_owned)
            .collect();
        namespaces.sort();
        namespaces.dedup();

        Ok(Self(namespaces))
    }
}

impl Display for WatchNamespaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

impl WatchNamespaces {
    /// Returns one [`WatchNamespace`] per control loop that should be started.
    pub fn scopes(&self) -> Vec<WatchNamespace> {
        if self.0.is_empty() {
            vec![WatchNamespace::All]
        } else {
            self.0
                .iter()
                .map(|namespace| WatchNamespace::One(namespace.clone()))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("", vec![WatchNamespace::All])]
    #[case(" , ", vec![WatchNamespace::All])]
    #[case("shop", vec![WatchNamespace::One("shop".to_owned())])]
    #[case(
        "web, shop,web",
        vec![WatchNamespace::One("shop".to_owned()), WatchNamespace::One("web".to_owned())]
    )]
    fn scopes_from_list(#[case] input: &str, #[case] expected: Vec<WatchNamespace>) {
        let namespaces: WatchNamespaces = input.parse().expect("parsing is infallible");
        assert_eq!(namespaces.scopes(), expected);
    }
}
