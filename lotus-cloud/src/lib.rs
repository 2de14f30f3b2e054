mod client;

pub use client::{
    ApiErrorClass, BlobInfo, CloudClient, CloudError, RecordEntry, RecordFilter, RecordPage,
    TransferLink,
};
