//! Names in the tree: users (`ann@example.com`) and the slash-separated
//! paths under them (`ann@example.com/dir/file.txt`).
//!
//! These are namespace paths, not filesystem paths, so [`camino`] and
//! friends don't apply; a parsed path is just a user plus its elements.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A user's name, always `someone@somewhere`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserName(String);

impl UserName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        match name.split_once('@') {
            Some((user, domain)) if !user.is_empty() && !domain.is_empty() => Ok(Self(name)),
            _ => Err(Error::Invalid(format!("bad user name {name:?}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully-qualified path name in canonical form:
/// `user@domain/` for a root, `user@domain/a/b` below it.
///
/// This is the form entries carry and the log stores. Anything that needs
/// to walk the path parses it into a [`Parsed`] first.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathName(String);

impl PathName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse(&self) -> Result<Parsed> {
        Parsed::parse(&self.0)
    }
}

impl fmt::Display for PathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A path broken into its user and elements, ready to walk.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Parsed {
    user: UserName,
    elems: Vec<String>,
}

impl Parsed {
    /// Parses `user@domain/a/b`. A trailing slash is accepted (and is the
    /// canonical spelling of a root); empty elements are not.
    pub fn parse(name: &str) -> Result<Self> {
        let (user, rest) = match name.split_once('/') {
            Some((user, rest)) => (user, rest),
            None => (name, ""),
        };
        let user = UserName::new(user)?;
        let mut elems = Vec::new();
        if !rest.is_empty() {
            for elem in rest.trim_end_matches('/').split('/') {
                if elem.is_empty() {
                    return Err(Error::Invalid(format!("bad path name {name:?}")));
                }
                elems.push(elem.to_owned());
            }
        }
        Ok(Self { user, elems })
    }

    /// The root of the given user.
    pub fn root(user: &UserName) -> Self {
        Self {
            user: user.clone(),
            elems: Vec::new(),
        }
    }

    pub fn user(&self) -> &UserName {
        &self.user
    }

    pub fn is_root(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn nelem(&self) -> usize {
        self.elems.len()
    }

    pub fn elem(&self, i: usize) -> &str {
        &self.elems[i]
    }

    /// The final element. Panics on a root; check [`is_root`](Self::is_root)
    /// first.
    pub fn last(&self) -> &str {
        self.elems.last().expect("last() on a root path")
    }

    /// The first `n` elements as a path.
    pub fn first(&self, n: usize) -> Self {
        Self {
            user: self.user.clone(),
            elems: self.elems[..n].to_vec(),
        }
    }

    /// Everything but the final element.
    pub fn parent(&self) -> Self {
        assert!(!self.is_root(), "parent() on a root path");
        self.first(self.nelem() - 1)
    }

    pub fn join(&self, elem: &str) -> Self {
        let mut elems = self.elems.clone();
        elems.push(elem.to_owned());
        Self {
            user: self.user.clone(),
            elems,
        }
    }

    /// The canonical string form.
    pub fn path(&self) -> PathName {
        PathName(self.to_string())
    }

    /// Is `self` a path-wise prefix of `name`?
    /// (`u@x/a` is a prefix of `u@x/a` and `u@x/a/b`, not of `u@x/ab`.)
    pub fn is_prefix_of(&self, name: &PathName) -> bool {
        let prefix = self.to_string();
        let prefix = prefix.trim_end_matches('/');
        let name = name.as_str().trim_end_matches('/');
        match name.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for Parsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.user)?;
        let mut first = true;
        for elem in &self.elems {
            if !first {
                f.write_str("/")?;
            }
            f.write_str(elem)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_round_trips() -> Result<()> {
        let p = Parsed::parse("ann@example.com/dir/file.txt")?;
        assert_eq!(p.user().as_str(), "ann@example.com");
        assert_eq!(p.nelem(), 2);
        assert_eq!(p.elem(0), "dir");
        assert_eq!(p.last(), "file.txt");
        assert_eq!(p.path().as_str(), "ann@example.com/dir/file.txt");
        Ok(())
    }

    #[test]
    fn roots() -> Result<()> {
        for root in ["ann@example.com", "ann@example.com/"] {
            let p = Parsed::parse(root)?;
            assert!(p.is_root());
            assert_eq!(p.path().as_str(), "ann@example.com/");
        }
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "nobody", "@x/a", "u@/a", "u@x//a", "u@x/a//b"] {
            assert!(Parsed::parse(bad).is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn parents_and_joins() -> Result<()> {
        let p = Parsed::parse("u@x/a/b/c")?;
        assert_eq!(p.parent().path().as_str(), "u@x/a/b");
        assert_eq!(p.first(1).path().as_str(), "u@x/a");
        assert_eq!(p.first(0).path().as_str(), "u@x/");
        assert_eq!(p.parent().join("c"), p);
        Ok(())
    }

    #[test]
    fn prefixes() -> Result<()> {
        let p = Parsed::parse("u@x/a")?;
        assert!(p.is_prefix_of(&PathName::from("u@x/a")));
        assert!(p.is_prefix_of(&PathName::from("u@x/a/b")));
        assert!(!p.is_prefix_of(&PathName::from("u@x/ab")));
        assert!(!p.is_prefix_of(&PathName::from("v@x/a/b")));

        let root = Parsed::parse("u@x/")?;
        assert!(root.is_prefix_of(&PathName::from("u@x/")));
        assert!(root.is_prefix_of(&PathName::from("u@x/a")));
        Ok(())
    }
}
