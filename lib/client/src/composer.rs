use solana_sdk::instruction::Instruction;

use crate::error::MarginfiClientError;
use crate::utp::UtpIndex;

/// How a state-changing operation is bracketed with observations and a
/// margin check inside one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionLayout {
    /// `[observe(active)..] + [op]`
    ObserveBefore,
    /// `[op] + [observe(active)..] + [verify]`
    ObserveAndCheckAfter,
    /// `[observe(target)] + [op] + [observe(active)..] + [verify]`
    HalfSandwichObserveCheck(UtpIndex),
}

/// Operations that change a margin account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    WithdrawCollateral,
    UtpDeposit,
    UtpDepositCrank(UtpIndex),
    UtpWithdraw,
    UtpTrade,
    DeactivateUtp,
    Liquidate,
}

impl InstructionLayout {
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::WithdrawCollateral
            | Operation::UtpDeposit
            | Operation::UtpWithdraw
            | Operation::UtpTrade => InstructionLayout::ObserveAndCheckAfter,
            Operation::UtpDepositCrank(target) => InstructionLayout::HalfSandwichObserveCheck(target),
            Operation::DeactivateUtp | Operation::Liquidate => InstructionLayout::ObserveBefore,
        }
    }
}

/// Observe instructions for the active utps, in slot order.
pub type Observes = Vec<(UtpIndex, Instruction)>;

/// Orders `main` and the observe/verify instructions according to `layout`.
///
/// `verify` is only used by the layouts that end in a margin check.
pub fn compose(
    layout: InstructionLayout,
    mut observes: Observes,
    main: Vec<Instruction>,
    verify: Instruction,
) -> Result<Vec<Instruction>, MarginfiClientError> {
    observes.sort_by_key(|(index, _)| *index);
    let mut instructions = Vec::with_capacity(observes.len() * 2 + main.len() + 1);
    match layout {
        InstructionLayout::ObserveBefore => {
            instructions.extend(observes.into_iter().map(|(_, ix)| ix));
            instructions.extend(main);
        }
        InstructionLayout::ObserveAndCheckAfter => {
            instructions.extend(main);
            instructions.extend(observes.into_iter().map(|(_, ix)| ix));
            instructions.push(verify);
        }
        InstructionLayout::HalfSandwichObserveCheck(target) => {
            let target_observe = observes
                .iter()
                .find(|(index, _)| *index == target)
                .map(|(_, ix)| ix.clone())
                .ok_or(MarginfiClientError::UtpNotActive(target))?;
            instructions.push(target_observe);
            instructions.extend(main);
            instructions.extend(observes.into_iter().map(|(_, ix)| ix));
            instructions.push(verify);
        }
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;

    fn tagged(tag: u8) -> Instruction {
        Instruction {
            program_id: Pubkey::default(),
            accounts: vec![],
            data: vec![tag],
        }
    }

    fn tags(ixs: &[Instruction]) -> Vec<u8> {
        ixs.iter().map(|ix| ix.data[0]).collect()
    }

    const DRIFT: u8 = 10;
    const MANGO: u8 = 11;
    const MAIN: u8 = 1;
    const VERIFY: u8 = 2;

    fn observes() -> Observes {
        // deliberately out of order
        vec![
            (UtpIndex::Mango, tagged(MANGO)),
            (UtpIndex::Drift, tagged(DRIFT)),
        ]
    }

    #[test]
    fn test_observe_before() -> anyhow::Result<()> {
        let ixs = compose(
            InstructionLayout::ObserveBefore,
            observes(),
            vec![tagged(MAIN)],
            tagged(VERIFY),
        )?;
        assert_eq!(tags(&ixs), vec![DRIFT, MANGO, MAIN]);
        Ok(())
    }

    #[test]
    fn test_observe_and_check_after() -> anyhow::Result<()> {
        let ixs = compose(
            InstructionLayout::ObserveAndCheckAfter,
            observes(),
            vec![tagged(MAIN), tagged(MAIN + 100)],
            tagged(VERIFY),
        )?;
        assert_eq!(tags(&ixs), vec![MAIN, MAIN + 100, DRIFT, MANGO, VERIFY]);

        // nothing to observe still ends in a check
        let ixs = compose(
            InstructionLayout::ObserveAndCheckAfter,
            vec![],
            vec![tagged(MAIN)],
            tagged(VERIFY),
        )?;
        assert_eq!(tags(&ixs), vec![MAIN, VERIFY]);
        Ok(())
    }

    #[test]
    fn test_half_sandwich() -> anyhow::Result<()> {
        let ixs = compose(
            InstructionLayout::HalfSandwichObserveCheck(UtpIndex::Mango),
            observes(),
            vec![tagged(MAIN)],
            tagged(VERIFY),
        )?;
        assert_eq!(tags(&ixs), vec![MANGO, MAIN, DRIFT, MANGO, VERIFY]);

        let err = compose(
            InstructionLayout::HalfSandwichObserveCheck(UtpIndex::Drift),
            vec![(UtpIndex::Mango, tagged(MANGO))],
            vec![tagged(MAIN)],
            tagged(VERIFY),
        )
        .unwrap_err();
        assert!(matches!(err, MarginfiClientError::UtpNotActive(UtpIndex::Drift)));
        Ok(())
    }

    #[test]
    fn test_layout_selection() {
        assert_eq!(
            InstructionLayout::for_operation(Operation::WithdrawCollateral),
            InstructionLayout::ObserveAndCheckAfter
        );
        assert_eq!(
            InstructionLayout::for_operation(Operation::UtpWithdraw),
            InstructionLayout::ObserveAndCheckAfter
        );
        assert_eq!(
            InstructionLayout::for_operation(Operation::UtpTrade),
            InstructionLayout::ObserveAndCheckAfter
        );
        assert_eq!(
            InstructionLayout::for_operation(Operation::UtpDepositCrank(UtpIndex::Drift)),
            InstructionLayout::HalfSandwichObserveCheck(UtpIndex::Drift)
        );
        assert_eq!(
            InstructionLayout::for_operation(Operation::DeactivateUtp),
            InstructionLayout::ObserveBefore
        );
    }
}
