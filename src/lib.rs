pub mod quota;

pub use quota::{
    ClearScope, ClearSummary, ClientDirectory, ClientType, PersistenceType, Principal, QuotaConfig, QuotaError,
    QuotaEvent, QuotaHandle, QuotaManager, QuotaRequest, QuotaResult,
};
