use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-env-changed=EON_THREADS_MAX");
    println!("cargo:rerun-if-env-changed=EON_RETIRE_FREQ_LOG");

    let out_dir = env::var("OUT_DIR").expect("no out directory");
    let dest = Path::new(&out_dir).join("build_constants.rs");

    let mut file = File::create(&dest).expect("could not create file");

    let threads: usize = env::var("EON_THREADS_MAX")
        .map_or(Ok(8192), |var| var.parse())
        .expect("failed to parse env variable EON_THREADS_MAX");

    if threads == 0 {
        panic!("invalid EON_THREADS_MAX value (0)");
    }

    let retire_freq_log: u32 = env::var("EON_RETIRE_FREQ_LOG")
        .map_or(Ok(5), |var| var.parse())
        .expect("failed to parse env variable EON_RETIRE_FREQ_LOG");

    if retire_freq_log > 16 {
        panic!("invalid EON_RETIRE_FREQ_LOG value (> 16)");
    }

    write!(
        &mut file,
        "pub(crate) const THREADS_MAX: usize = {};\n\
         pub(crate) const RETIRE_FREQ_LOG: u32 = {};\n",
        threads, retire_freq_log
    )
    .expect("could not write to file");
}
