fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Windows binaries link the VC runtime statically so the service runs
    // without the redistributable installed
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("windows") {
        static_vcruntime::metabuild();
    }
}
