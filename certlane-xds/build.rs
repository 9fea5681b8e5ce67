fn main() -> Result<(), Box<dyn std::error::Error>> {
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/envoy/service/secret/v3/sds.proto",
                "proto/envoy/extensions/transport_sockets/tls/v3/secret.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
