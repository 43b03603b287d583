//! CRD YAML Generator
//!
//! Prints the Backup and Restore CRD manifests.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use lvm_backup_operator::crd::generate_crds;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
