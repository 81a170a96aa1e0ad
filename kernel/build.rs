fn main() {
    // Only bare-metal AArch64 images need the fixed layout; host test
    // builds link normally.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.starts_with("aarch64") && target.contains("none") {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{}/linker.ld", dir);
    }
    println!("cargo:rerun-if-changed=linker.ld");
}
