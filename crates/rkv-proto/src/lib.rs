//! Generated protobuf types and gRPC stubs for the `rkv.v1` package.

pub mod v1 {
    tonic::include_proto!("rkv.v1");
}

/// Encoded descriptors of every `rkv.v1` file, for gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");
