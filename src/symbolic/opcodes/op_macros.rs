#[macro_export]
macro_rules! binary_op {
    ($state:expr, $op:ident) => {
        let a = $state.sym_stack.pop();
        let b = $state.sym_stack.pop();
        $state.sym_stack.push(a.$op(&b));
    };
    ($state:expr, $func:path) => {
        let a = $state.sym_stack.pop();
        let b = $state.sym_stack.pop();
        $state.sym_stack.push($func(&a, &b));
    };
}

/// Shift opcodes take the shift amount first and the value second.
#[macro_export]
macro_rules! shift_op {
    ($state:expr, $op:ident) => {
        let shift = $state.sym_stack.pop();
        let value = $state.sym_stack.pop();
        $state.sym_stack.push(value.$op(&shift));
    };
}

#[macro_export]
macro_rules! unary_op {
    ($state:expr, $op:ident) => {
        let a = $state.sym_stack.pop();
        $state.sym_stack.push(a.$op());
    };
}

#[macro_export]
macro_rules! comparison_op {
    ($state:expr, $op:ident) => {
        let a = $state.sym_stack.pop();
        let b = $state.sym_stack.pop();
        let res = a.$op(&b);
        $state.sym_stack.push(res.ite(
            &$crate::symbolic::utils::math::one($state.context),
            &$crate::symbolic::utils::math::zero($state.context),
        ));
    };
}
