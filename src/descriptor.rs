use serde_json::Value;

/// A named field on a plant that receives a proxy to another plant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPoint {
    pub field: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBinding {
    pub field: String,
    /// Dotted path into the plant's config. Empty means the whole config.
    pub path: String,
}

/// Runs `method` for every send whose leading args equal `matcher`.
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub matcher: Vec<Value>,
    pub method: String,
}

impl Listener {
    pub fn matches(&self, args: &[Value]) -> bool {
        self.matcher.len() <= args.len() && self.matcher.iter().zip(args).all(|(m, a)| m == a)
    }
}

/// Declarative wiring of a plant: what it injects, which configs it binds,
/// what it listens to and whether it has an init hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDescriptor {
    pub injections: Vec<InjectionPoint>,
    pub queues: Vec<InjectionPoint>,
    pub configs: Vec<ConfigBinding>,
    pub listeners: Vec<Listener>,
    pub init: bool,
}

impl ServiceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a proxy into `field`, deducing the target from the field name
    /// (`access` -> `Access`).
    pub fn inject(self, field: &str) -> Self {
        let target = deduce_target(field);
        self.inject_as(field, &target)
    }

    pub fn inject_as(mut self, field: &str, target: &str) -> Self {
        self.injections.push(InjectionPoint {
            field: field.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Injects a send-only proxy whose messages go through the reliable queue.
    pub fn queue(self, field: &str) -> Self {
        let target = deduce_target(field);
        self.queue_as(field, &target)
    }

    pub fn queue_as(mut self, field: &str, target: &str) -> Self {
        self.queues.push(InjectionPoint {
            field: field.to_string(),
            target: target.to_string(),
        });
        self
    }

    pub fn config(self, field: &str) -> Self {
        self.config_at(field, field)
    }

    pub fn config_at(mut self, field: &str, path: &str) -> Self {
        self.configs.push(ConfigBinding {
            field: field.to_string(),
            path: path.to_string(),
        });
        self
    }

    pub fn on<I>(mut self, matcher: I, method: &str) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.listeners.push(Listener {
            matcher: matcher.into_iter().map(Into::into).collect(),
            method: method.to_string(),
        });
        self
    }

    pub fn with_init(mut self) -> Self {
        self.init = true;
        self
    }

    /// Plants this one must be initialized after. Queue points are not
    /// edges: publishing never waits on the receiver.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.injections.iter().map(|point| point.target.as_str())
    }

    pub fn injection(&self, field: &str) -> Option<&InjectionPoint> {
        self.injections.iter().find(|point| point.field == field)
    }

    pub fn queue_point(&self, field: &str) -> Option<&InjectionPoint> {
        self.queues.iter().find(|point| point.field == field)
    }

    pub fn config_binding(&self, field: &str) -> Option<&ConfigBinding> {
        self.configs.iter().find(|binding| binding.field == field)
    }

    pub fn listeners_for<'a>(&'a self, args: &'a [Value]) -> impl Iterator<Item = &'a str> + 'a {
        self.listeners
            .iter()
            .filter(move |listener| listener.matches(args))
            .map(|listener| listener.method.as_str())
    }
}

/// `access` -> `Access`, `userStore` -> `UserStore`.
pub fn deduce_target(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
