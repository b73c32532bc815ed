use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

/// Compiles every kernels/*.cu to PTX in OUT_DIR when the `cuda` feature is
/// active. The wrappers embed the PTX with include_str! and JIT it against
/// the current context, so no -arch pinning happens here.
fn main() {
    println!("cargo:rerun-if-changed=kernels");

    if env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let nvcc = env::var("NVCC").unwrap_or_else(|_| "nvcc".to_string());

    let entries = fs::read_dir("kernels").expect("kernels/ directory missing");
    for entry in entries {
        let path = entry.expect("unreadable kernels/ entry").path();
        if path.extension().map(|e| e != "cu").unwrap_or(true) {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .expect("kernel file name is not UTF-8");
        let ptx = out_dir.join(format!("{stem}.ptx"));

        println!("cargo:rerun-if-changed={}", path.display());
        let status = Command::new(&nvcc)
            .arg("-ptx")
            .arg("-O3")
            .arg(&path)
            .arg("-o")
            .arg(&ptx)
            .status()
            .unwrap_or_else(|e| panic!("failed to run {nvcc}: {e}"));
        if !status.success() {
            panic!("nvcc failed on {} with {status}", path.display());
        }
    }
}
