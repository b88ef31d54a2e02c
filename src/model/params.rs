//! Named parameter collections.
//!
//! Every sub-module (GPT, each codec encoder/decoder, the speaker table) owns
//! one [`ParamStore`]. Models are built from its [`VarBuilder`], so pretrained
//! or fine-tuned weights are loaded *into* the existing vars after
//! construction, and the optimizer picks vars by name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{Error, Result};

/// Outcome of loading a safetensors file into a store.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub loaded: usize,
    /// Store vars the file did not provide.
    pub missing: Vec<String>,
    /// File tensors with no matching var.
    pub unused: Vec<String>,
}

#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| Error::WeightLoad("parameter store lock poisoned".into()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Sorted var names.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Result<Option<Var>> {
        Ok(self.lock()?.get(name).cloned())
    }

    /// Insert (or replace) a var under `name`.
    pub fn insert(&self, name: impl Into<String>, value: &Tensor) -> Result<Var> {
        let var = Var::from_tensor(&value.to_dtype(self.dtype)?.to_device(&self.device)?)?;
        self.lock()?.insert(name.into(), var.clone());
        Ok(var)
    }

    /// Vars whose name satisfies `keep`, ordered by name.
    pub fn vars_where(&self, keep: impl Fn(&str) -> bool) -> Result<Vec<Var>> {
        let data = self.lock()?;
        let mut named: Vec<(&String, &Var)> = data.iter().filter(|(n, _)| keep(n)).collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
    }

    pub fn all_vars(&self) -> Result<Vec<Var>> {
        self.vars_where(|_| true)
    }

    /// Drop vars whose name satisfies `remove`; returns how many were dropped.
    pub fn remove_where(&self, remove: impl Fn(&str) -> bool) -> Result<usize> {
        let mut data = self.lock()?;
        let before = data.len();
        data.retain(|name, _| !remove(name));
        Ok(before - data.len())
    }

    /// Detached copies of every var, keyed by name.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        let data = self.lock()?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?.detach())))
            .collect()
    }

    /// Copy tensors from a safetensors file into matching vars.
    ///
    /// File names are normalized (weight-norm parametrization aliases) and
    /// prefixed with `prefix` before matching. A tensor whose shape differs
    /// from its var is an error.
    pub fn load_safetensors(&self, path: impl AsRef<Path>, prefix: &str) -> Result<LoadReport> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &self.device)
            .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?;

        let data = self.lock()?;
        let mut report = LoadReport::default();
        let mut seen = std::collections::HashSet::new();
        for (file_name, tensor) in tensors {
            let name = format!("{prefix}{}", normalize_name(&file_name));
            match data.get(&name) {
                Some(var) => {
                    if var.shape() != tensor.shape() {
                        return Err(Error::WeightLoad(format!(
                            "{}: {name} has shape {:?}, expected {:?}",
                            path.display(),
                            tensor.dims(),
                            var.dims()
                        )));
                    }
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                    seen.insert(name);
                    report.loaded += 1;
                }
                None => report.unused.push(file_name),
            }
        }
        report.missing = data.keys().filter(|n| !seen.contains(*n)).cloned().collect();
        report.missing.sort();
        report.unused.sort();

        tracing::debug!(
            "{}: loaded {} tensors ({} missing, {} unused)",
            path.display(),
            report.loaded,
            report.missing.len(),
            report.unused.len()
        );
        Ok(report)
    }

    /// Load a checkpoint written by [`ParamStore::save`]; every var must be present.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let report = self.load_safetensors(path, "")?;
        if !report.missing.is_empty() {
            return Err(Error::WeightLoad(format!(
                "{}: missing {} tensors (first: {})",
                path.display(),
                report.missing.len(),
                report.missing[0]
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .save(path)
            .map_err(|e| Error::WeightLoad(format!("saving {}: {e}", path.display())))
    }
}

/// Map `torch.nn.utils.parametrizations.weight_norm` names onto the legacy
/// `weight_g` / `weight_v` layout the models use.
fn normalize_name(name: &str) -> String {
    name.replace("parametrizations.weight.original0", "weight_g")
        .replace("parametrizations.weight.original1", "weight_v")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    fn store_with_linear() -> ParamStore {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let vb = store.var_builder();
        candle_nn::linear(3, 2, vb.pp("proj")).unwrap();
        store
    }

    #[test]
    fn names_and_selection() {
        let store = store_with_linear();
        assert_eq!(store.names().unwrap(), vec!["proj.bias", "proj.weight"]);
        let weights = store.vars_where(|n| n.ends_with("weight")).unwrap();
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[0].dims(), &[2, 3]);
    }

    #[test]
    fn save_then_load_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proj.safetensors");
        let store = store_with_linear();
        store.save(&path).unwrap();

        let other = store_with_linear();
        other.load_checkpoint(&path).unwrap();
        let a = store.snapshot().unwrap();
        let b = other.snapshot().unwrap();
        for (name, tensor) in &a {
            let diff: f32 = (tensor - &b[name])
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(diff, 0.0, "{name} differs");
        }
    }

    #[test]
    fn prefixed_load_with_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.safetensors");
        let g = Tensor::ones((2, 1), DType::F32, &Device::Cpu).unwrap();
        let v = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let extra = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        candle_core::safetensors::save(
            &HashMap::from([
                ("head.parametrizations.weight.original0".to_string(), g),
                ("head.parametrizations.weight.original1".to_string(), v),
                ("unrelated".to_string(), extra),
            ]),
            &path,
        )
        .unwrap();

        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let vb = store.var_builder();
        vb.get_with_hints((2, 1), "m.head.weight_g", Init::Const(0.0)).unwrap();
        vb.get_with_hints((2, 3), "m.head.weight_v", Init::Const(0.0)).unwrap();
        vb.get_with_hints(5, "m.other", Init::Const(0.0)).unwrap();

        let report = store.load_safetensors(&path, "m.").unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.missing, vec!["m.other"]);
        assert_eq!(report.unused, vec!["unrelated"]);

        let loaded: f32 = store
            .get("m.head.weight_v")
            .unwrap()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(loaded, 6.0);
        assert!(store.load_checkpoint(&path).is_err());
    }

    #[test]
    fn remove_by_predicate() {
        let store = store_with_linear();
        assert_eq!(store.remove_where(|n| n.ends_with("bias")).unwrap(), 1);
        assert_eq!(store.names().unwrap(), vec!["proj.weight"]);
    }
}
