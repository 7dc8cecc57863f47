// Lifecycle event names
// One place for every event name the runtime publishes on its own behalf

//! Event names are built from the subject (port or pool) and the upper-cased
//! model or pool name, e.g. `portTimeout_chargePayment_ORDER`.

pub fn port_timeout(port: &str, model_name: &str) -> String {
    format!("portTimeout_{}_{}", port, model_name.to_uppercase())
}

pub fn port_retry_failed(port: &str, model_name: &str) -> String {
    format!("portRetryFailed_{}_{}", port, model_name.to_uppercase())
}

pub fn port_retry_worked(port: &str, model_name: &str) -> String {
    format!("portRetryWorked_{}_{}", port, model_name.to_uppercase())
}

pub fn undo_started(model_name: &str) -> String {
    format!("undoStart_{}", model_name.to_uppercase())
}

pub fn undo_failed(model_name: &str) -> String {
    format!("undoFailed_{}", model_name.to_uppercase())
}

pub fn undo_worked(model_name: &str) -> String {
    format!("undoWorked_{}", model_name.to_uppercase())
}

pub fn pool_open(pool: &str) -> String {
    format!("poolOpen_{}", pool.to_uppercase())
}

pub fn pool_close(pool: &str) -> String {
    format!("poolClose_{}", pool.to_uppercase())
}

pub fn pool_drain(pool: &str) -> String {
    format!("poolDrain_{}", pool.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_upper_case_the_subject_owner() {
        assert_eq!(port_timeout("charge", "order"), "portTimeout_charge_ORDER");
        assert_eq!(port_retry_failed("charge", "Order"), "portRetryFailed_charge_ORDER");
        assert_eq!(undo_worked("order"), "undoWorked_ORDER");
        assert_eq!(pool_drain("orders"), "poolDrain_ORDERS");
    }
}
