//! Saving and restoring network parameters.
//!
//! Parameters are flattened in module traversal order and written, together
//! with their shapes, as a named MessagePack record through burn's recorder.
//! Restoring checks count and shapes against the receiving network before
//! touching it. Values are stored at full precision and cast to the
//! backend's float type on load.
use std::fs;
use std::path::Path;

use burn::module::{Module, ModuleMapper, ModuleVisitor, Param};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::PersistenceError;

/// Tag appended as the extension of parameter files.
pub const FRAMEWORK: &str = "burn";

type ParameterRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Shapes and flattened values, one entry per float parameter.
type ParameterRecord<B> = (Vec<Vec<usize>>, Vec<Tensor<B, 1>>);

struct Collector<B: Backend> {
    shapes: Vec<Vec<usize>>,
    values: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for Collector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let dims = tensor.dims();

        self.shapes.push(dims.to_vec());
        self.values.push(tensor.reshape([dims.iter().product::<usize>()]));
    }
}

struct ShapeCheck<'a> {
    stored: &'a [Vec<usize>],
    index: usize,
    mismatch: Option<PersistenceError>,
}

impl<'a, B: Backend> ModuleVisitor<B> for ShapeCheck<'a> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(stored) = self.stored.get(self.index) {
            let expected = param.val().dims().to_vec();

            if self.mismatch.is_none() && *stored != expected {
                self.mismatch = Some(PersistenceError::ShapeMismatch {
                    index: self.index,
                    expected,
                    found: stored.clone(),
                });
            }
        }

        self.index += 1;
    }
}

struct Restorer<B: Backend> {
    values: std::vec::IntoIter<Tensor<B, 1>>,
}

impl<B: Backend> ModuleMapper<B> for Restorer<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let values = match self.values.next() {
            Some(values) => values,
            None => return param,
        };

        param.map(|tensor| {
            let require_grad = tensor.is_require_grad();

            values
                .reshape(tensor.dims())
                .to_device(&tensor.device())
                .set_require_grad(require_grad)
        })
    }
}

/// Write every float parameter of `module` to `path`.
///
/// The path is used as given; no extension is added.
pub fn save<B, M, P>(module: &M, path: P) -> Result<(), PersistenceError>
where
    B: Backend,
    M: Module<B>,
    P: AsRef<Path>,
{
    let mut collector = Collector {
        shapes: Vec::new(),
        values: Vec::new(),
    };
    module.visit(&mut collector);

    let record: ParameterRecord<B> = (collector.shapes, collector.values);
    let bytes = Recorder::<B>::record(&ParameterRecorder::default(), record, ())?;

    fs::write(path, bytes)?;

    Ok(())
}

/// Restore the parameters of `module` from `path`.
///
/// Fails without modifying anything if the file holds a different number
/// of parameters or any shape differs.
pub fn load<B, M, P>(module: M, path: P, device: &B::Device) -> Result<M, PersistenceError>
where
    B: Backend,
    M: Module<B>,
    P: AsRef<Path>,
{
    let bytes = fs::read(path)?;
    let (shapes, values): ParameterRecord<B> =
        Recorder::<B>::load(&ParameterRecorder::default(), bytes, device)?;

    if shapes.len() != values.len() {
        return Err(PersistenceError::ParameterCount {
            expected: shapes.len(),
            found: values.len(),
        });
    }

    let mut check = ShapeCheck {
        stored: &shapes,
        index: 0,
        mismatch: None,
    };
    module.visit(&mut check);

    if check.index != shapes.len() {
        return Err(PersistenceError::ParameterCount {
            expected: check.index,
            found: shapes.len(),
        });
    }

    if let Some(mismatch) = check.mismatch {
        return Err(mismatch);
    }

    let mut restorer = Restorer {
        values: values.into_iter(),
    };

    Ok(module.map(&mut restorer))
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use burn::tensor::TensorData;

    use super::*;
    use crate::models::network::NetworkConfig;
    use crate::models::{CellKind, Tying};

    type TestBackend = NdArray;

    fn config(num_items: usize, hidden_dims: Vec<usize>) -> NetworkConfig {
        NetworkConfig {
            num_items,
            input_size: num_items,
            cell: CellKind::Gru,
            hidden_dims,
            embedding_dim: 3,
            dropout: 0.0,
            tying: Tying::Untied,
            derive_target: false,
            share_weights: false,
            temperature: 1.0,
            gamma: 1.0,
            regularization: 0.0,
        }
    }

    fn inputs(
        num_items: usize,
        device: &<TestBackend as Backend>::Device,
    ) -> (Tensor<TestBackend, 3>, Tensor<TestBackend, 2>) {
        let mut input = vec![0.0_f32; 2 * num_items];
        input[1] = 1.0;
        input[num_items + 3] = 1.0;

        (
            Tensor::from_data(TensorData::new(input, [1, 2, num_items]), device),
            Tensor::from_data(TensorData::new(vec![1.0_f32, 1.0], [1, 2]), device),
        )
    }

    #[test]
    fn round_trip_reproduces_predictions() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("model.{}", FRAMEWORK));

        let (network, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();
        let (input, mask) = inputs(5, &device);
        let expected: Vec<f32> = network
            .forward(input.clone(), mask.clone())
            .into_data()
            .to_vec()
            .unwrap();

        save::<TestBackend, _, _>(&network, &path).unwrap();

        let (fresh, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();
        let restored = load::<TestBackend, _, _>(fresh, &path, &device).unwrap();
        let predicted: Vec<f32> = restored.forward(input, mask).into_data().to_vec().unwrap();

        assert_eq!(expected, predicted);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.burn");

        let (network, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();
        save::<TestBackend, _, _>(&network, &path).unwrap();

        let (bigger, _) = config(6, vec![4]).assemble::<TestBackend>(&device).unwrap();
        match load::<TestBackend, _, _>(bigger, &path, &device) {
            Err(PersistenceError::ShapeMismatch {
                index,
                expected,
                found,
            }) => {
                assert_eq!(index, 0);
                assert_eq!(expected, vec![6, 3]);
                assert_eq!(found, vec![5, 3]);
            }
            other => panic!("Expected a shape mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn parameter_count_mismatch_is_fatal() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.burn");

        let (network, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();
        save::<TestBackend, _, _>(&network, &path).unwrap();

        let (deeper, _) = config(5, vec![4, 4]).assemble::<TestBackend>(&device).unwrap();
        match load::<TestBackend, _, _>(deeper, &path, &device) {
            Err(PersistenceError::ParameterCount { expected, found }) => assert!(expected > found),
            other => panic!("Expected a count mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let device = Default::default();
        let (network, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();

        match load::<TestBackend, _, _>(network, "/nonexistent/model.burn", &device) {
            Err(PersistenceError::Io(_)) => {}
            other => panic!("Expected an I/O error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn file_is_written_at_the_exact_path_as_a_burn_record() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("model.{}", FRAMEWORK));

        let (network, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();
        save::<TestBackend, _, _>(&network, &path).unwrap();

        assert!(path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let (shapes, values): ParameterRecord<TestBackend> = Recorder::<TestBackend>::load(
            &ParameterRecorder::default(),
            std::fs::read(&path).unwrap(),
            &device,
        )
        .unwrap();

        assert_eq!(shapes.len(), values.len());
        assert_eq!(shapes[0], vec![5, 3]);
        assert_eq!(values[0].dims(), [15]);
    }

    #[test]
    fn corrupt_file_is_a_record_error() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.burn");
        std::fs::write(&path, b"{\"parameters\": []}").unwrap();

        let (network, _) = config(5, vec![4]).assemble::<TestBackend>(&device).unwrap();

        match load::<TestBackend, _, _>(network, &path, &device) {
            Err(PersistenceError::Record(_)) => {}
            other => panic!("Expected a record error, got {:?}", other.map(|_| ())),
        }
    }
}
