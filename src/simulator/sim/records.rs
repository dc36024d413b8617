/// Appends a `ModelRecord` stamped with the current simulation time.
///
/// The model needs a `records: Vec<ModelRecord>` field.
///
/// ```ignore
/// model_record!(self, services, "tlb_fill", format!("{:#x}", vpage));
/// ```
#[macro_export]
macro_rules! model_record {
  ($self:expr, $services:expr, $action:expr, $subject:expr) => {
    $self.records.push(sim::models::ModelRecord {
      time: $services.global_time(),
      action: $action.to_string(),
      subject: $subject.to_string(),
    });
  };
}
