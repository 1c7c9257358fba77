//! Conversion entry point: hook a module tree, trace one forward, extract.
use crate::functional::FunctionTable;
use crate::internal::*;
use crate::mask_rcnn;
use crate::module::{leaf_modules, modules};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// A model placeholder.
#[derive(Clone, Debug, PartialEq, new)]
pub struct InputSpec {
    pub name: String,
    pub shape: Shape,
    pub datum_type: DatumType,
}

/// What to feed the traced forward: placeholders in argument order, and the
/// ones frozen to a value (traced as `Const` instead of `Parameter`).
///
/// Deserializes from JSON, shapes written as in `"1,3,?,?,f32"`:
///
/// ```
/// # use mo_pytorch::prelude::*;
/// let config = TraceConfig::from_json(r#"{
///     "inputs": [
///         { "name": "image", "shape": "1,3,224,224" },
///         { "name": "scale", "shape": "1", "dtype": "f32" }
///     ],
///     "frozen": { "scale": [0.5] }
/// }"#).unwrap();
/// assert_eq!(config.inputs.len(), 2);
/// assert!(config.frozen_value("scale").is_some());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawTraceConfig")]
pub struct TraceConfig {
    pub inputs: Vec<InputSpec>,
    pub frozen: Vec<(String, Arc<Tensor>)>,
}

impl TraceConfig {
    /// One f32 input, named `input`.
    pub fn single(shape: impl Into<Shape>) -> TraceConfig {
        TraceConfig::default().with_input("input", shape)
    }

    pub fn with_input(mut self, name: impl Into<String>, shape: impl Into<Shape>) -> TraceConfig {
        self.inputs.push(InputSpec::new(name.into(), shape.into(), DatumType::F32));
        self
    }

    pub fn with_dtype(mut self, name: &str, dt: DatumType) -> MoResult<TraceConfig> {
        let input = self.input_mut(name)?;
        input.datum_type = dt;
        Ok(self)
    }

    pub fn with_frozen(mut self, name: &str, value: impl IntoArcTensor) -> MoResult<TraceConfig> {
        self.input_mut(name)?;
        self.frozen.retain(|(n, _)| n != name);
        self.frozen.push((name.to_string(), value.into_arc_tensor()));
        Ok(self)
    }

    pub fn from_json(json: &str) -> MoResult<TraceConfig> {
        serde_json::from_str(json).context("Parsing trace configuration")
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    fn input_mut(&mut self, name: &str) -> MoResult<&mut InputSpec> {
        self.inputs.iter_mut().find(|i| i.name == name).with_context(|| format!("No input named {name}"))
    }

    pub fn frozen_value(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.frozen.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn validate(&self) -> MoResult<()> {
        ensure!(!self.inputs.is_empty(), "No model input");
        for (ix, input) in self.inputs.iter().enumerate() {
            ensure!(
                !self.inputs[..ix].iter().any(|i| i.name == input.name),
                "Input {} is declared twice",
                input.name
            );
        }
        for (name, value) in &self.frozen {
            let input = self.input(name).with_context(|| format!("Frozen value for unknown input {name}"))?;
            let compatible = input.shape.len() == value.rank()
                && input.shape.iter().zip(value.shape()).all(|(d, &v)| d.as_i64().is_none_or(|d| d == v as i64));
            ensure!(
                compatible,
                "Frozen value of {} is {:?}, input shape is [{}]",
                name,
                value.shape(),
                input.shape.iter().join(",")
            );
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTraceConfig {
    #[serde(default)]
    input_shape: Option<String>,
    #[serde(default)]
    inputs: Vec<RawInput>,
    #[serde(default)]
    frozen: BTreeMap<String, RawValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInput {
    name: String,
    shape: String,
    #[serde(default)]
    dtype: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Scalar(f64),
    List(Vec<f64>),
}

impl TryFrom<RawTraceConfig> for TraceConfig {
    type Error = MoError;

    fn try_from(raw: RawTraceConfig) -> MoResult<TraceConfig> {
        let mut config = TraceConfig::default();
        if let Some(shape) = raw.input_shape {
            ensure!(raw.inputs.is_empty(), "Both input_shape and inputs are given");
            let (shape, dt) = parse_shape(&shape)?;
            config = config.with_input("input", shape).with_dtype("input", dt.unwrap_or_default())?;
        }
        for input in raw.inputs {
            let (shape, suffix) = parse_shape(&input.shape).with_context(|| format!("Shape of {}", input.name))?;
            let dt = match input.dtype {
                Some(dt) => dt.parse()?,
                None => suffix.unwrap_or_default(),
            };
            config = config.with_input(&input.name, shape).with_dtype(&input.name, dt)?;
        }
        for (name, value) in raw.frozen {
            let input = config.input(&name).with_context(|| format!("Frozen value for unknown input {name}"))?;
            let values = match value {
                RawValue::Scalar(v) => vec![v],
                RawValue::List(vs) => vs,
            };
            let shape = input.shape.iter().map(|d| d.to_usize()).collect::<MoResult<TVec<usize>>>()?;
            let tensor = tensor_from_f64s(input.datum_type, &shape, &values)
                .with_context(|| format!("Frozen value of {name}"))?;
            config = config.with_frozen(&name, tensor)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn tensor_from_f64s(dt: DatumType, shape: &[usize], values: &[f64]) -> MoResult<Tensor> {
    match dt {
        DatumType::Bool => Tensor::from_shape(shape, &values.iter().map(|&v| v != 0.0).collect_vec()),
        DatumType::U8 => Tensor::from_shape(shape, &values.iter().map(|&v| v as u8).collect_vec()),
        DatumType::I32 => Tensor::from_shape(shape, &values.iter().map(|&v| v as i32).collect_vec()),
        DatumType::I64 => Tensor::from_shape(shape, &values.iter().map(|&v| v as i64).collect_vec()),
        DatumType::F32 => Tensor::from_shape(shape, &values.iter().map(|&v| v as f32).collect_vec()),
        DatumType::F64 => Tensor::from_shape(shape, values),
        DatumType::F16 => bail!("No constant storage for {:?} tensors", dt),
    }
}

/// Installs forward overrides for one module class.
pub type ModelHook = fn(&dyn Module, &TraceContext) -> MoResult<()>;

/// Model hooks, keyed by fully qualified class name.
#[derive(Clone, Default)]
pub struct ModelHookRegistry(HashMap<String, ModelHook>);

impl ModelHookRegistry {
    pub fn insert(&mut self, class_name: &str, hook: ModelHook) -> MoResult<()> {
        ensure!(!self.0.contains_key(class_name), "Duplicate model hook for {}", class_name);
        self.0.insert(class_name.to_string(), hook);
        Ok(())
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.0.contains_key(class_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run the matching hook of every module of the tree, returns how many
    /// ran.
    pub fn apply(&self, root: &dyn Module, cx: &TraceContext) -> MoResult<usize> {
        let mut applied = 0;
        for module in modules(root) {
            if let Some(hook) = self.0.get(module.class_name()) {
                hook(module, cx).with_context(|| format!("Applying model hook of {}", module.class_name()))?;
                applied += 1;
            }
        }
        Ok(applied)
    }
}

pub fn register_all_model_hooks(reg: &mut ModelHookRegistry) -> MoResult<()> {
    reg.insert(mask_rcnn::MASK_RCNN_CLASS, mask_rcnn::register_hook)?;
    Ok(())
}

/// The tracing front-end: interception table, extractors and model hooks.
///
/// Registries are built once and shared by every conversion; each `load`
/// gets its own trace context and returns the graph it built.
#[derive(Clone)]
pub struct Loader {
    pub functions: FunctionTable,
    pub extractors: ExtractorRegistry,
    pub model_hooks: ModelHookRegistry,
}

/// A loader with every built-in function handler, extractor and model hook.
pub fn pytorch() -> MoResult<Loader> {
    let mut model_hooks = ModelHookRegistry::default();
    register_all_model_hooks(&mut model_hooks)?;
    Ok(Loader { functions: FunctionTable::default(), extractors: crate::ops::extractors()?, model_hooks })
}

impl Loader {
    /// Trace one forward of `model`, without extraction: nodes keep their
    /// framework `op`s.
    pub fn trace(&self, model: &dyn Module, config: &TraceConfig) -> MoResult<Graph> {
        config.validate()?;
        let cx = TraceContext::new(self.functions.clone());
        {
            let mut graph = cx.graph_mut();
            graph.set_property("fw", "pytorch");
            graph.set_property("layout", "NCHW");
        }
        let mut inputs = vec![];
        for input in &config.inputs {
            let proxy = match config.frozen_value(&input.name) {
                Some(value) => cx.frozen(&input.name, value.clone())?,
                None => cx.source(&input.name, input.shape.clone(), input.datum_type)?,
            };
            inputs.push(Value::from(proxy));
        }
        let leaves = leaf_modules(model);
        for leaf in &leaves {
            cx.hook(*leaf);
        }
        let hooked = self.model_hooks.apply(model, &cx)?;
        debug!(
            "Tracing {}: {} input(s), {} leaf module(s), {} model hook(s)",
            model.class_name(),
            inputs.len(),
            leaves.len(),
            hooked
        );

        let output = cx.call(model, &inputs).with_context(|| format!("Tracing {}", model.class_name()))?;
        let mut results = vec![];
        for leaf in output.leaves() {
            match leaf {
                Value::Tensor(t) => results.push(cx.output(t)?),
                other => bail!(TraceError::integrity(format!("Model output is a {}", other.kind()))),
            }
        }
        ensure!(!results.is_empty(), TraceError::integrity("Model has no output"));
        let graph = cx.take_graph();
        info!("Traced {} node(s), outputs: {}", graph.nodes().len(), results.join(", "));
        Ok(graph)
    }

    /// Trace and extract: every node of the returned graph is typed.
    pub fn load(&self, model: &dyn Module, config: &TraceConfig) -> MoResult<Graph> {
        let mut graph = self.trace(model, config)?;
        extract_node_attrs(&mut graph, &self.extractors)?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Conv2d, Linear, ReLU, Sequential};

    #[test]
    fn json_single_input() {
        let config = TraceConfig::from_json(r#"{ "input_shape": "1,3,?,?" }"#).unwrap();
        assert_eq!(config.inputs.len(), 1);
        assert_eq!(config.inputs[0].name, "input");
        assert_eq!(config.inputs[0].shape, tvec!(1.into(), 3.into(), Dim::Unknown, Dim::Unknown));
        assert_eq!(config.inputs[0].datum_type, DatumType::F32);
    }

    #[test]
    fn json_named_inputs() {
        let config = TraceConfig::from_json(
            r#"{
                "inputs": [
                    { "name": "ids", "shape": "1,128,i64" },
                    { "name": "mask", "shape": "1,128", "dtype": "i32" },
                    { "name": "training", "shape": "", "dtype": "bool" }
                ],
                "frozen": { "training": 0 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.inputs.iter().map(|i| &*i.name).collect_vec(), vec!["ids", "mask", "training"]);
        assert_eq!(config.inputs[0].datum_type, DatumType::I64);
        assert_eq!(config.inputs[1].datum_type, DatumType::I32);
        let frozen = config.frozen_value("training").unwrap();
        assert_eq!(frozen.datum_type(), DatumType::Bool);
        assert!(!frozen.to_scalar::<bool>().unwrap());
    }

    #[test]
    fn json_errors() {
        assert!(TraceConfig::from_json(r#"{ "input_shape": "1,x" }"#).is_err());
        assert!(TraceConfig::from_json(r#"{ "inputs": [], "frozen": { "a": 1 } }"#).is_err());
        assert!(TraceConfig::from_json(r#"{ "input": "1,3" }"#).is_err());
        assert!(TraceConfig::from_json(r#"{ "inputs": [{ "name": "x", "shape": "2" }], "frozen": { "x": [1, 2, 3] } }"#)
            .is_err());
    }

    #[test]
    fn builder_checks_names() {
        assert!(TraceConfig::single(to_shape([1, 3])).with_dtype("x", DatumType::I64).is_err());
        assert!(TraceConfig::single(to_shape([1, 3])).with_frozen("x", tensor0(1f32)).is_err());
        let dup = TraceConfig::single(to_shape([1])).with_input("input", to_shape([2]));
        assert!(dup.validate().is_err());
    }

    #[test]
    fn trace_properties_and_outputs() {
        crate::setup_test_logger();
        let model = Sequential::default().push(Linear::new(4, 2)).push(ReLU);
        let graph = pytorch().unwrap().trace(&model, &TraceConfig::single(to_shape([1, 4]))).unwrap();
        assert_eq!(graph.properties.get("fw"), Some(&Attr::from("pytorch")));
        assert_eq!(graph.properties.get("layout"), Some(&Attr::from("NCHW")));
        assert_eq!(graph.inputs().len(), 1);
        let outputs = graph.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "output");
        assert!(graph.nodes().iter().all(|n| !n.is_typed()));
    }

    #[test]
    fn frozen_input_is_const() {
        crate::setup_test_logger();
        let model = Conv2d::new(1, 1, 1);
        let config = TraceConfig::single(to_shape([1, 1, 2, 2]))
            .with_frozen("input", Tensor::zeros(DatumType::F32, &[1, 1, 2, 2]).unwrap())
            .unwrap();
        let graph = pytorch().unwrap().load(&model, &config).unwrap();
        assert_eq!(graph.node("input").unwrap().op, "Const");
        assert!(graph.inputs().is_empty());
    }

    #[test]
    fn model_hooks_match_class() {
        fn mark(_module: &dyn Module, cx: &TraceContext) -> MoResult<()> {
            cx.constant(tensor0(1f32))?;
            Ok(())
        }
        let mut hooks = ModelHookRegistry::default();
        hooks.insert("torch.nn.modules.activation.ReLU", mark).unwrap();
        assert!(hooks.insert("torch.nn.modules.activation.ReLU", mark).is_err());
        let model = Sequential::default().push(ReLU).push(Linear::new(2, 2)).push(ReLU);
        let cx = TraceContext::new(FunctionTable::default());
        assert_eq!(hooks.apply(&model, &cx).unwrap(), 2);
        assert_eq!(cx.graph().nodes().len(), 2);
    }

    #[test]
    fn opaque_output() {
        struct Untraced;
        impl TracedOp for Untraced {
            fn type_name(&self) -> &str {
                "Untraced"
            }
        }
        impl Module for Untraced {
            fn forward(&self, _cx: &TraceContext, _inputs: &[Value]) -> MoResult<Value> {
                Ok(Value::Tuple(vec![Value::Opaque]))
            }
        }
        // a leaf, so hooked: the hook rejects a tuple it can not infer
        let err = pytorch().unwrap().trace(&Untraced, &TraceConfig::single(to_shape([1]))).unwrap_err();
        assert!(err.downcast_ref::<TraceError>().is_some());
    }
}
