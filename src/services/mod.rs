pub mod access_token;
pub mod checksum;
pub mod chunk_assembler;
pub mod cluster;
pub mod delivery;
pub mod metadata;
pub mod security;
pub mod storage;
pub mod upload;
