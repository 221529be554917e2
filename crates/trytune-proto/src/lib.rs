pub mod trytune {
    pub mod v1 {
        tonic::include_proto!("trytune.v1");
    }
}

/// Encoded descriptor set for gRPC server reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("trytune_descriptor");
