//! Content paths.
//!
//! A [`ContentPath`] is `/{namespace}/{root}/{rest...}` where the namespace is
//! either `object` (root is a CID, content is immutable) or `name` (root is a
//! mutable name to be resolved). An [`ImmutablePath`] is a content path known
//! to live in the `object` namespace; only those reach the backend's content
//! operations.

use std::fmt;
use std::str::FromStr;

use cid::Cid;

use crate::cids::parse_cid;
use crate::error::GatewayError;

/// Path namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Immutable content addressed by CID.
    Object,
    /// Mutable names resolved to object paths.
    Name,
}

impl Namespace {
    /// All namespaces, in the order they are advertised.
    pub const ALL: [Namespace; 2] = [Namespace::Object, Namespace::Name];

    /// The URL segment for this namespace.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Name => "name",
        }
    }

    /// The `/{namespace}` URL prefix.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Object => "/object",
            Self::Name => "/name",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object" => Ok(Self::Object),
            "name" => Ok(Self::Name),
            other => Err(GatewayError::InvalidPath {
                path: format!("/{other}"),
                reason: format!("unknown namespace {other:?}"),
            }),
        }
    }
}

/// A namespaced content path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentPath {
    namespace: Namespace,
    /// Root first; never empty.
    segments: Vec<String>,
    trailing_slash: bool,
}

impl ContentPath {
    /// Parse an already percent-decoded path such as `/object/bafy.../a/b`.
    pub fn parse(input: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| GatewayError::InvalidPath {
            path: input.to_owned(),
            reason: reason.to_owned(),
        };

        let rest = input
            .strip_prefix('/')
            .ok_or_else(|| invalid("path must start with '/'"))?;
        let mut parts = rest.split('/').filter(|s| !s.is_empty() && *s != ".");
        let namespace: Namespace = parts
            .next()
            .ok_or_else(|| invalid("path does not have enough components"))?
            .parse()
            .map_err(|_| invalid("unknown namespace"))?;
        let segments: Vec<String> = parts.map(str::to_owned).collect();
        if segments.is_empty() {
            return Err(invalid("path does not have enough components"));
        }
        if segments.iter().any(|s| s == "..") {
            return Err(invalid("path must not contain '..'"));
        }
        if namespace == Namespace::Object {
            parse_cid(&segments[0])?;
        }

        Ok(Self {
            namespace,
            segments,
            trailing_slash: input.len() > 1 && input.ends_with('/'),
        })
    }

    /// Build a path from its parts.
    pub fn from_parts<I, S>(namespace: Namespace, root: &str, rest: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = format!("/{namespace}/{root}");
        for segment in rest {
            raw.push('/');
            raw.push_str(segment.as_ref());
        }
        Self::parse(&raw)
    }

    /// An `object` path rooted at `cid`.
    #[must_use]
    pub fn from_cid(cid: &Cid) -> Self {
        Self {
            namespace: Namespace::Object,
            segments: vec![cid.to_string()],
            trailing_slash: false,
        }
    }

    /// The namespace.
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The root identifier: a CID or a mutable name.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Segments after the root.
    #[must_use]
    pub fn rest(&self) -> &[String] {
        &self.segments[1..]
    }

    /// Root and remaining segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments including the namespace.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len() + 1
    }

    /// Whether the path was written with a trailing slash.
    #[must_use]
    pub fn has_trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    /// Whether the root must be resolved before content can be fetched.
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.namespace == Namespace::Name
    }

    /// The `/{namespace}/{root}` prefix.
    #[must_use]
    pub fn root_path(&self) -> Self {
        Self {
            namespace: self.namespace,
            segments: vec![self.segments[0].clone()],
            trailing_slash: false,
        }
    }

    /// A child path one segment deeper.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(
            segment
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
        );
        Self {
            namespace: self.namespace,
            segments,
            trailing_slash: false,
        }
    }

    /// The parent path, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        (self.segments.len() > 1).then(|| Self {
            namespace: self.namespace,
            segments: self.segments[..self.segments.len() - 1].to_vec(),
            trailing_slash: false,
        })
    }

    /// Replace the root and prepend `prefix` segments to the remainder.
    #[must_use]
    pub fn rebase(&self, namespace: Namespace, root: &str, prefix: &[String]) -> Self {
        let mut segments = Vec::with_capacity(1 + prefix.len() + self.rest().len());
        segments.push(root.to_owned());
        segments.extend_from_slice(prefix);
        segments.extend_from_slice(self.rest());
        Self {
            namespace,
            segments,
            trailing_slash: self.trailing_slash,
        }
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.namespace)?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        if self.trailing_slash {
            f.write_str("/")?;
        }
        Ok(())
    }
}

impl FromStr for ContentPath {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A content path in the `object` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImmutablePath {
    path: ContentPath,
    root: Cid,
}

impl ImmutablePath {
    /// The root CID.
    #[must_use]
    pub fn root_cid(&self) -> Cid {
        self.root
    }

    /// The underlying content path.
    #[must_use]
    pub fn as_content_path(&self) -> &ContentPath {
        &self.path
    }

    /// A child path one segment deeper.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        Self {
            path: self.path.join(segment),
            root: self.root,
        }
    }

    /// The `/object/{root}` prefix.
    #[must_use]
    pub fn root_path(&self) -> Self {
        Self {
            path: self.path.root_path(),
            root: self.root,
        }
    }

    /// Segments after the root.
    #[must_use]
    pub fn rest(&self) -> &[String] {
        self.path.rest()
    }
}

impl TryFrom<ContentPath> for ImmutablePath {
    type Error = GatewayError;

    fn try_from(path: ContentPath) -> Result<Self, Self::Error> {
        if path.namespace != Namespace::Object {
            return Err(GatewayError::InvalidPath {
                path: path.to_string(),
                reason: "path is not immutable".to_owned(),
            });
        }
        let root = parse_cid(path.root())?;
        Ok(Self { path, root })
    }
}

impl From<Cid> for ImmutablePath {
    fn from(cid: Cid) -> Self {
        Self {
            path: ContentPath::from_cid(&cid),
            root: cid,
        }
    }
}

impl fmt::Display for ImmutablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.path, f)
    }
}

/// A path whose final segment has been resolved to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// The path that was resolved.
    pub path: ImmutablePath,
    /// The block the last link pointed to.
    pub cid: Cid,
    /// Segments that address data inside that block rather than another
    /// block, joined with `/`. Empty when the path ends on a block.
    pub remainder: String,
}

/// What resolving a path learned along the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMetadata {
    /// One CID per traversed segment except the last.
    pub path_segment_roots: Vec<Cid>,
    /// Where the path ended up.
    pub last_segment: ResolvedPath,
    /// Content type hint from the backend, if it knows one.
    pub content_type: Option<String>,
}
