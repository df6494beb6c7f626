fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use vendored protoc binary, no system installation required
    let protoc_path = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc_path);

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["src/proto/lbx.proto"], &["src/proto"])?;

    println!("cargo:rerun-if-changed=src/proto/lbx.proto");
    Ok(())
}
