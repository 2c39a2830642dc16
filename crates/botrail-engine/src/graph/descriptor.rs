use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use botrail_core::{StepError, TypeTag, ValidationError, Value};

use crate::step::{RouteResolver, StepContext, StepFn};

/// How a step chooses its successor.
#[derive(Clone, Default)]
pub enum Routing {
    /// The step is terminal.
    #[default]
    None,
    Static(String),
    /// Route key of the produced value -> target step.
    Conditional(BTreeMap<String, String>),
    Dynamic {
        resolver: Arc<dyn RouteResolver>,
        targets: BTreeSet<String>,
    },
    /// Fan the produced collection out to the element step.
    MapFanOut(String),
}

impl Routing {
    /// Every step name this routing may dispatch to, in a stable order.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Routing::None => vec![],
            Routing::Static(t) | Routing::MapFanOut(t) => vec![t.as_str()],
            Routing::Conditional(map) => {
                let set: BTreeSet<&str> = map.values().map(String::as_str).collect();
                set.into_iter().collect()
            }
            Routing::Dynamic { targets, .. } => targets.iter().map(String::as_str).collect(),
        }
    }

    /// Conditional and dynamic routes pick among several successors.
    pub fn is_branching(&self) -> bool {
        matches!(self, Routing::Conditional(_) | Routing::Dynamic { .. })
    }

    fn kind(&self) -> &'static str {
        match self {
            Routing::None => "none",
            Routing::Static(_) => "static",
            Routing::Conditional(_) => "conditional",
            Routing::Dynamic { .. } => "dynamic",
            Routing::MapFanOut(_) => "map_fan_out",
        }
    }
}

impl fmt::Debug for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Routing::None => write!(f, "None"),
            Routing::Static(t) => f.debug_tuple("Static").field(t).finish(),
            Routing::Conditional(map) => f.debug_tuple("Conditional").field(map).finish(),
            Routing::Dynamic { targets, .. } => f
                .debug_struct("Dynamic")
                .field("targets", targets)
                .finish_non_exhaustive(),
            Routing::MapFanOut(t) => f.debug_tuple("MapFanOut").field(t).finish(),
        }
    }
}

impl PartialEq for Routing {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Routing::None, Routing::None) => true,
            (Routing::Static(a), Routing::Static(b)) => a == b,
            (Routing::MapFanOut(a), Routing::MapFanOut(b)) => a == b,
            (Routing::Conditional(a), Routing::Conditional(b)) => a == b,
            (
                Routing::Dynamic {
                    resolver: ra,
                    targets: ta,
                },
                Routing::Dynamic {
                    resolver: rb,
                    targets: tb,
                },
            ) => Arc::ptr_eq(ra, rb) && ta == tb,
            _ => false,
        }
    }
}

/// Immutable description of one named step.
#[derive(Clone)]
pub struct StepDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_type: TypeTag,
    pub output_type: TypeTag,
    pub routing: Routing,
    pub is_start: bool,
    /// Halt right after this step produces output unless the gate is approved.
    pub requires_approval: bool,
    /// Closes a map region; invoked once with every element output.
    pub is_fold: bool,
    body: Arc<dyn StepFn>,
}

impl StepDescriptor {
    pub fn new<F>(name: impl Into<String>, input_type: TypeTag, output_type: TypeTag, body: F) -> Self
    where
        F: Fn(Value, &StepContext<'_>) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self::with_body(name, input_type, output_type, Arc::new(body))
    }

    /// Build a descriptor around an already shared body.
    pub fn with_body(
        name: impl Into<String>,
        input_type: TypeTag,
        output_type: TypeTag,
        body: Arc<dyn StepFn>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_type,
            output_type,
            routing: Routing::None,
            is_start: false,
            requires_approval: false,
            is_fold: false,
            body,
        }
    }

    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn fold(mut self) -> Self {
        self.is_fold = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn route_to(mut self, target: impl Into<String>) -> Self {
        self.routing = Routing::Static(target.into());
        self
    }

    /// Conditional routing from `(route key, target)` pairs.
    pub fn route_on<K, T>(mut self, branches: impl IntoIterator<Item = (K, T)>) -> Self
    where
        K: Into<String>,
        T: Into<String>,
    {
        self.routing = Routing::Conditional(
            branches
                .into_iter()
                .map(|(k, t)| (k.into(), t.into()))
                .collect(),
        );
        self
    }

    pub fn route_with<R, T>(mut self, resolver: R, targets: impl IntoIterator<Item = T>) -> Self
    where
        R: Fn(&Value) -> Result<String, StepError> + Send + Sync + 'static,
        T: Into<String>,
    {
        self.routing = Routing::Dynamic {
            resolver: Arc::new(resolver),
            targets: targets.into_iter().map(Into::into).collect(),
        };
        self
    }

    pub fn fan_out_to(mut self, element_step: impl Into<String>) -> Self {
        self.routing = Routing::MapFanOut(element_step.into());
        self
    }

    pub fn body(&self) -> &dyn StepFn {
        self.body.as_ref()
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .field("routing", &self.routing.kind())
            .field("is_start", &self.is_start)
            .field("requires_approval", &self.requires_approval)
            .field("is_fold", &self.is_fold)
            .finish_non_exhaustive()
    }
}

impl PartialEq for StepDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.input_type == other.input_type
            && self.output_type == other.output_type
            && self.routing == other.routing
            && self.is_start == other.is_start
            && self.requires_approval == other.requires_approval
            && self.is_fold == other.is_fold
            && Arc::ptr_eq(&self.body, &other.body)
    }
}

/// Owned collection of descriptors handed to the validator.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: BTreeMap<String, StepDescriptor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: StepDescriptor) -> Result<(), ValidationError> {
        if self.steps.contains_key(&step.name) {
            return Err(ValidationError::DuplicateStep(step.name));
        }
        self.steps.insert(step.name.clone(), step);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, step: StepDescriptor) -> Result<Self, ValidationError> {
        self.register(step)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.values()
    }

    pub(crate) fn into_steps(self) -> BTreeMap<String, StepDescriptor> {
        self.steps
    }
}
