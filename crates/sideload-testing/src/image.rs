//! Textual module images understood by [`FakeRegistry`](crate::FakeRegistry)
//!
//! ```text
//! sideload-fake-module v1
//! type Addon ctor
//! method OnLoad 0 instance
//! method OnReload 0 instance panic
//! tag build-2
//! ```
//!
//! `method` lines belong to the closest `type` line above them. `tag` lines
//! only change the bytes, which is handy for content-change tests.

use std::fmt::Write as _;

/// First line of every fake image
pub const HEADER: &str = "sideload-fake-module v1";

/// How a type behaves when constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructBehavior {
    /// Default constructor succeeds
    Ctor,
    /// No default constructor, like a static utility type
    Static,
    /// Constructor raises an error
    CtorFails,
}

impl ConstructBehavior {
    fn keyword(self) -> &'static str {
        match self {
            ConstructBehavior::Ctor => "ctor",
            ConstructBehavior::Static => "static",
            ConstructBehavior::CtorFails => "ctor-fails",
        }
    }

    pub(crate) fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "ctor" => Some(ConstructBehavior::Ctor),
            "static" => Some(ConstructBehavior::Static),
            "ctor-fails" => Some(ConstructBehavior::CtorFails),
            _ => None,
        }
    }
}

/// How a method behaves when invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodBehavior {
    Ok,
    Panic,
    Fail,
}

impl MethodBehavior {
    fn keyword(self) -> Option<&'static str> {
        match self {
            MethodBehavior::Ok => None,
            MethodBehavior::Panic => Some("panic"),
            MethodBehavior::Fail => Some("fail"),
        }
    }

    pub(crate) fn parse(keyword: Option<&str>) -> Option<Self> {
        match keyword {
            None => Some(MethodBehavior::Ok),
            Some("panic") => Some(MethodBehavior::Panic),
            Some("fail") => Some(MethodBehavior::Fail),
            Some(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MethodSpec {
    pub name: String,
    pub parameters: usize,
    pub is_static: bool,
    pub behavior: MethodBehavior,
}

#[derive(Debug, Clone)]
pub(crate) struct TypeSpec {
    pub name: String,
    pub construct: ConstructBehavior,
    pub methods: Vec<MethodSpec>,
}

/// Builder for a fake module image
#[derive(Debug, Clone, Default)]
pub struct ModuleImage {
    types: Vec<TypeSpec>,
    tag: Option<String>,
}

impl ModuleImage {
    /// An image with no types at all
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual `Addon` type with `OnLoad` and `OnReload` instance callbacks
    pub fn addon() -> Self {
        Self::new()
            .with_type("Addon", ConstructBehavior::Ctor)
            .method("OnLoad", 0, false)
            .method("OnReload", 0, false)
    }

    /// Start a new type; following `method` calls attach to it
    pub fn with_type(mut self, name: &str, construct: ConstructBehavior) -> Self {
        self.types.push(TypeSpec {
            name: name.to_string(),
            construct,
            methods: Vec::new(),
        });
        self
    }

    /// Add a well-behaved method to the last type
    pub fn method(self, name: &str, parameters: usize, is_static: bool) -> Self {
        self.method_with(name, parameters, is_static, MethodBehavior::Ok)
    }

    pub fn method_with(
        mut self,
        name: &str,
        parameters: usize,
        is_static: bool,
        behavior: MethodBehavior,
    ) -> Self {
        if self.types.is_empty() {
            self = self.with_type("Addon", ConstructBehavior::Ctor);
        }
        if let Some(last) = self.types.last_mut() {
            last.methods.push(MethodSpec {
                name: name.to_string(),
                parameters,
                is_static,
                behavior,
            });
        }
        self
    }

    /// Change the image bytes without changing its shape
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", HEADER);
        for ty in &self.types {
            let _ = writeln!(out, "type {} {}", ty.name, ty.construct.keyword());
            for method in &ty.methods {
                let kind = if method.is_static { "static" } else { "instance" };
                let _ = write!(out, "method {} {} {}", method.name, method.parameters, kind);
                if let Some(keyword) = method.behavior.keyword() {
                    let _ = write!(out, " {}", keyword);
                }
                out.push('\n');
            }
        }
        if let Some(tag) = &self.tag {
            let _ = writeln!(out, "tag {}", tag);
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.render().into_bytes()
    }

    /// Bytes the fake adapter refuses
    pub fn malformed() -> Vec<u8> {
        b"\x00\x01 definitely not a module".to_vec()
    }

    pub(crate) fn parse(text: &str) -> Result<Vec<TypeSpec>, String> {
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(HEADER) {
            return Err("missing image header".to_string());
        }

        let mut types: Vec<TypeSpec> = Vec::new();
        for (index, line) in lines.enumerate() {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                [] => {}
                ["tag", ..] => {}
                ["type", name, construct] => {
                    let construct = ConstructBehavior::parse(construct)
                        .ok_or_else(|| format!("line {}: bad constructor kind", index + 2))?;
                    types.push(TypeSpec {
                        name: name.to_string(),
                        construct,
                        methods: Vec::new(),
                    });
                }
                ["method", name, parameters, kind, rest @ ..] => {
                    let parameters = parameters
                        .parse::<usize>()
                        .map_err(|e| format!("line {}: {}", index + 2, e))?;
                    let is_static = match *kind {
                        "static" => true,
                        "instance" => false,
                        other => return Err(format!("line {}: bad method kind {}", index + 2, other)),
                    };
                    let behavior = MethodBehavior::parse(rest.first().copied())
                        .ok_or_else(|| format!("line {}: bad method behavior", index + 2))?;
                    let owner = types
                        .last_mut()
                        .ok_or_else(|| format!("line {}: method outside of a type", index + 2))?;
                    owner.methods.push(MethodSpec {
                        name: name.to_string(),
                        parameters,
                        is_static,
                        behavior,
                    });
                }
                _ => return Err(format!("line {}: unrecognized", index + 2)),
            }
        }
        Ok(types)
    }
}
