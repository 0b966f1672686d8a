use anyhow::Result;
use kube::CustomResourceExt;
use training_operator::crd::{MPIJob, MXJob, PodGroup, PyTorchJob, TFJob, XGBoostJob};

fn main() -> Result<()> {
    let crds = [
        ("TFJob", TFJob::crd()),
        ("PyTorchJob", PyTorchJob::crd()),
        ("MXJob", MXJob::crd()),
        ("XGBoostJob", XGBoostJob::crd()),
        ("MPIJob", MPIJob::crd()),
        // only needed on clusters without Volcano installed
        ("PodGroup", PodGroup::crd()),
    ];

    for (kind, crd) in crds {
        println!("---");
        println!("# {} CRD", kind);
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
