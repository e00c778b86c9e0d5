//! Typed media-graph description.
//!
//! A `Graph` is an ordered list of stage descriptors plus the links between
//! them. It is assembled with `GraphBuilder`, validated once in
//! `GraphBuilder::finish`, and only then handed to a media backend. Nothing
//! in here talks to GStreamer; the same description is rendered to
//! gst-launch syntax for logging.

use std::collections::HashSet;
use std::fmt;

use crate::error::GraphError;

/// Property value of an element.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Fraction(i32, i32),
}

impl PropValue {
    /// Launch-syntax rendering; strings with separators are quoted.
    fn to_launch(&self) -> String {
        match self {
            PropValue::Str(s) if needs_quotes(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Str(s) => f.write_str(s),
            PropValue::Int(v) => write!(f, "{}", v),
            PropValue::Float(v) => write!(f, "{}", v),
            PropValue::Bool(v) => write!(f, "{}", v),
            PropValue::Fraction(n, d) => write!(f, "{}/{}", n, d),
        }
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<u32> for PropValue {
    fn from(v: u32) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || matches!(c, '!' | ',' | '"' | '='))
}

/// What a stage is.
#[derive(Clone, Debug, PartialEq)]
pub enum StageKind {
    /// An element instantiated from a named factory.
    Element {
        factory: String,
        properties: Vec<(String, PropValue)>,
    },
    /// A caps filter restricting the stream format.
    Caps {
        media_type: String,
        fields: Vec<(String, PropValue)>,
    },
}

/// One node of the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct StageSpec {
    name: Option<String>,
    kind: StageKind,
}

impl StageSpec {
    pub fn element(factory: &str) -> Self {
        Self {
            name: None,
            kind: StageKind::Element {
                factory: factory.to_string(),
                properties: Vec::new(),
            },
        }
    }

    pub fn caps(media_type: &str) -> Self {
        Self {
            name: None,
            kind: StageKind::Caps {
                media_type: media_type.to_string(),
                fields: Vec::new(),
            },
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set an element property or caps field.
    pub fn prop(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        let entry = (key.to_string(), value.into());
        match &mut self.kind {
            StageKind::Element { properties, .. } => properties.push(entry),
            StageKind::Caps { fields, .. } => fields.push(entry),
        }
        self
    }

    pub fn kind(&self) -> &StageKind {
        &self.kind
    }

    pub fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Factory name, `capsfilter` for caps stages.
    pub fn factory(&self) -> &str {
        match &self.kind {
            StageKind::Element { factory, .. } => factory,
            StageKind::Caps { .. } => "capsfilter",
        }
    }

    /// Look up a property (or caps field) value by key.
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        let entries = match &self.kind {
            StageKind::Element { properties, .. } => properties,
            StageKind::Caps { fields, .. } => fields,
        };
        entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Caps string for caps stages, e.g. `video/x-raw, format=RGB`.
    pub fn caps_string(&self) -> Option<String> {
        let StageKind::Caps { media_type, fields } = &self.kind else {
            return None;
        };
        let mut out = media_type.clone();
        for (key, value) in fields {
            out.push_str(&format!(", {}={}", key, value.to_launch()));
        }
        Some(out)
    }
}

/// A directed link between two stages, optionally pinned to named pads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub from: String,
    pub from_pad: Option<String>,
    pub to: String,
    pub to_pad: Option<String>,
}

/// A stage with its resolved, unique name.
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub name: String,
    pub spec: StageSpec,
}

/// Validated graph description.
#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    stages: Vec<Stage>,
    links: Vec<Link>,
}

impl Graph {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Links leaving `name`, in insertion order.
    pub fn downstream(&self, name: &str) -> impl Iterator<Item = &Link> {
        let name = name.to_string();
        self.links.iter().filter(move |l| l.from == name)
    }

    /// Links entering `name`, in insertion order.
    pub fn upstream(&self, name: &str) -> impl Iterator<Item = &Link> {
        let name = name.to_string();
        self.links.iter().filter(move |l| l.to == name)
    }

    /// Follow single-output links from `start` until a stage has no output
    /// or fans out, returning the visited stage names.
    pub fn walk_from(&self, start: &str) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self.stage(start).map(|s| s.name.as_str());
        while let Some(name) = current {
            path.push(name);
            let mut next = self.downstream(name);
            current = match (next.next(), next.next()) {
                (Some(link), None) if !path.contains(&link.to.as_str()) => self
                    .stage(&link.to)
                    .map(|s| s.name.as_str()),
                _ => None,
            };
        }
        path
    }

    /// Render the graph in gst-launch syntax.
    pub fn to_launch_string(&self) -> String {
        let referenced: HashSet<&str> = self
            .stages
            .iter()
            .filter(|s| self.is_referenced(&s.name))
            .map(|s| s.name.as_str())
            .collect();

        let mut out: Vec<String> = Vec::new();
        let mut rendered: HashSet<&str> = HashSet::new();

        // Pad-targeted stages (muxers) are declared up front so branches can
        // link into them by name.
        for stage in &self.stages {
            if self.upstream(&stage.name).any(|l| l.to_pad.is_some()) {
                out.push(self.render_stage(stage, &referenced));
                rendered.insert(stage.name.as_str());
            }
        }

        let mut tail: Option<&str> = None;
        for link in &self.links {
            if tail != Some(link.from.as_str()) {
                if rendered.contains(link.from.as_str()) {
                    out.push(pad_ref(&link.from, link.from_pad.as_deref()));
                } else if let Some(stage) = self.stage(&link.from) {
                    out.push(self.render_stage(stage, &referenced));
                    rendered.insert(stage.name.as_str());
                }
            }
            out.push("!".to_string());
            if rendered.contains(link.to.as_str()) {
                out.push(pad_ref(&link.to, link.to_pad.as_deref()));
                tail = None;
            } else if let Some(stage) = self.stage(&link.to) {
                out.push(self.render_stage(stage, &referenced));
                rendered.insert(stage.name.as_str());
                tail = Some(stage.name.as_str());
            }
        }

        for stage in &self.stages {
            if !rendered.contains(stage.name.as_str()) {
                out.push(self.render_stage(stage, &referenced));
            }
        }

        out.join(" ")
    }

    /// Stages that launch syntax must name so branches can refer to them.
    fn is_referenced(&self, name: &str) -> bool {
        self.downstream(name).count() > 1 || self.upstream(name).any(|l| l.to_pad.is_some())
    }

    fn render_stage(&self, stage: &Stage, referenced: &HashSet<&str>) -> String {
        match stage.spec.kind() {
            StageKind::Caps { .. } => stage.spec.caps_string().unwrap_or_default(),
            StageKind::Element {
                factory,
                properties,
            } => {
                let mut out = factory.clone();
                if stage.spec.explicit_name().is_some() || referenced.contains(stage.name.as_str())
                {
                    out.push_str(&format!(" name={}", stage.name));
                }
                for (key, value) in properties {
                    out.push_str(&format!(" {}={}", key, value.to_launch()));
                }
                out
            }
        }
    }
}

fn pad_ref(stage: &str, pad: Option<&str>) -> String {
    format!("{}.{}", stage, pad.unwrap_or(""))
}

/// Incremental graph assembly with a moving cursor.
///
/// `chain` appends a stage linked from the cursor, `link_into` closes the
/// current branch into an existing stage and `resume` reopens a branch from
/// any existing stage (a tee or muxer output).
#[derive(Debug, Default)]
pub struct GraphBuilder {
    stages: Vec<Stage>,
    links: Vec<Link>,
    cursor: Option<String>,
    started: bool,
    last_closed: Option<String>,
    error: Option<GraphError>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage without linking it; the cursor is left untouched.
    pub fn declare(&mut self, spec: StageSpec) -> &mut Self {
        self.push(spec);
        self
    }

    /// Add a stage linked from the cursor and move the cursor onto it. The
    /// first chained stage becomes the source.
    pub fn chain(&mut self, spec: StageSpec) -> &mut Self {
        let from = self.cursor.take();
        if self.started && from.is_none() {
            self.fail(GraphError::NoCursor(
                self.last_closed.clone().unwrap_or_default(),
            ));
            return self;
        }
        self.started = true;
        if let Some(name) = self.push(spec) {
            if let Some(from) = from {
                self.links.push(Link {
                    from,
                    from_pad: None,
                    to: name.clone(),
                    to_pad: None,
                });
            }
            self.cursor = Some(name);
        }
        self
    }

    pub fn chain_all<I>(&mut self, specs: I) -> &mut Self
    where
        I: IntoIterator<Item = StageSpec>,
    {
        for spec in specs {
            self.chain(spec);
        }
        self
    }

    /// Link the cursor into `target` (optionally a specific request pad) and
    /// close the branch.
    pub fn link_into(&mut self, target: &str, pad: Option<&str>) -> &mut Self {
        let Some(from) = self.cursor.take() else {
            self.fail(GraphError::NoCursor(
                self.last_closed.clone().unwrap_or_default(),
            ));
            return self;
        };
        self.links.push(Link {
            from,
            from_pad: None,
            to: target.to_string(),
            to_pad: pad.map(str::to_string),
        });
        self.last_closed = Some(target.to_string());
        self
    }

    /// Reopen a branch at an existing stage.
    pub fn resume(&mut self, name: &str) -> &mut Self {
        if self.stages.iter().any(|s| s.name == name) {
            self.cursor = Some(name.to_string());
        } else {
            self.fail(GraphError::UnknownStage(name.to_string()));
        }
        self
    }

    /// Validate and produce the graph.
    pub fn finish(&mut self) -> Result<Graph, GraphError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let graph = Graph {
            stages: std::mem::take(&mut self.stages),
            links: std::mem::take(&mut self.links),
        };
        self.cursor = None;
        self.started = false;
        validate(&graph)?;
        Ok(graph)
    }

    fn push(&mut self, spec: StageSpec) -> Option<String> {
        let name = match spec.explicit_name() {
            Some(name) => name.to_string(),
            None => self.generated_name(spec.factory()),
        };
        if self.stages.iter().any(|s| s.name == name) {
            self.fail(GraphError::DuplicateStage(name));
            return None;
        }
        self.stages.push(Stage {
            name: name.clone(),
            spec,
        });
        Some(name)
    }

    fn generated_name(&self, factory: &str) -> String {
        let mut n = 0;
        loop {
            let candidate = format!("{}{}", factory, n);
            if !self.stages.iter().any(|s| s.name == candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn fail(&mut self, err: GraphError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

fn validate(graph: &Graph) -> Result<(), GraphError> {
    if graph.stages.is_empty() {
        return Err(GraphError::EmptyGraph);
    }

    let mut seen = HashSet::new();
    for stage in &graph.stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(GraphError::DuplicateStage(stage.name.clone()));
        }
    }

    let mut pads: HashSet<(&str, &str)> = HashSet::new();
    for link in &graph.links {
        for end in [&link.from, &link.to] {
            if !seen.contains(end.as_str()) {
                return Err(GraphError::UnknownStage(end.clone()));
            }
        }
        if link.from == link.to {
            return Err(GraphError::SelfLink {
                stage: link.from.clone(),
            });
        }
        for (stage, pad) in [(&link.from, &link.from_pad), (&link.to, &link.to_pad)] {
            if let Some(pad) = pad {
                if !pads.insert((stage.as_str(), pad.as_str())) {
                    return Err(GraphError::PadReused {
                        stage: stage.clone(),
                        pad: pad.clone(),
                    });
                }
            }
        }
    }

    let sources = graph
        .stages
        .iter()
        .filter(|s| graph.upstream(&s.name).next().is_none())
        .count();
    if sources != 1 {
        return Err(GraphError::Sources(sources));
    }

    // Only the final stage may end a branch; anything else without a
    // downstream link would stall its upstream.
    let last = graph.stages.iter().rev().find(|s| graph.downstream(&s.name).next().is_none());
    for stage in &graph.stages {
        if graph.downstream(&stage.name).next().is_none()
            && Some(stage.name.as_str()) != last.map(|s| s.name.as_str())
        {
            return Err(GraphError::DanglingBranch(stage.name.clone()));
        }
    }

    Ok(())
}
